//! TCP acceptor.
//!
//! The listening socket is opened with the configured backlog. On close the
//! listener asks the acceptor to nudge blocked accepts with short loopback
//! connects.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use linkport_core::{Acceptor, BoxedSocket, ListenerConfig};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Bound on each wake connect.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Acceptor over a tokio [`TcpListener`].
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    tcp_no_delay: bool,
}

impl TcpAcceptor {
    /// Open a listening socket on the configured address and port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &ListenerConfig) -> io::Result<Self> {
        let ip = config.address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, config.port);

        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.accept_listen_backlog)?;

        Ok(Self { listener, tcp_no_delay: config.tcp_no_delay })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<(BoxedSocket, SocketAddr)> {
        let (stream, remote_addr) = self.listener.accept().await?;
        if self.tcp_no_delay
            && let Err(e) = stream.set_nodelay(true)
        {
            debug!(%remote_addr, error = %e, "cannot set TCP_NODELAY");
        }
        Ok((Box::new(stream), remote_addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn wake_acceptors(&self, count: usize) {
        let Ok(local_addr) = self.local_addr() else {
            return;
        };
        let target = wake_target(local_addr);

        for _ in 0..count {
            match tokio::time::timeout(WAKE_CONNECT_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(_)) => {},
                Ok(Err(e)) => {
                    trace!(%target, error = %e, "wake connect failed");
                    break;
                },
                Err(_) => break,
            }
        }
    }
}

/// Loopback address reaching a socket bound to `local_addr`.
fn wake_target(local_addr: SocketAddr) -> SocketAddr {
    match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())
        },
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local_addr.port())
        },
        _ => local_addr,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn wildcard_binds_wake_through_loopback() {
        let any: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        assert_eq!(wake_target(any), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());

        let any6: SocketAddr = "[::]:9000".parse().unwrap();
        assert_eq!(wake_target(any6), "[::1]:9000".parse::<SocketAddr>().unwrap());

        let fixed: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        assert_eq!(wake_target(fixed), fixed);
    }

    #[tokio::test]
    async fn accepts_loopback_connection() {
        let config = ListenerConfig {
            address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            ..ListenerConfig::default()
        };
        let acceptor = TcpAcceptor::bind(&config).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut socket, remote_addr) = acceptor.accept().await.unwrap();
        assert!(remote_addr.ip().is_loopback());
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }
}
