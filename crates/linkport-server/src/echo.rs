//! Line-echo protocol.
//!
//! Each request is one line; the response is the same line. `quit` ends
//! the connection. The served binary runs this protocol, and it is small
//! enough to exercise every keepalive path end to end.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::protocol::{Protocol, ProtocolConnection, RequestContext};

/// Echoes newline-terminated lines back to the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineEchoProtocol;

impl Protocol for LineEchoProtocol {
    fn create_connection(&self, link_id: u64) -> Box<dyn ProtocolConnection> {
        Box::new(LineEchoConnection { link_id, last_line: None })
    }

    fn protocol_name(&self) -> &str {
        "echo"
    }
}

struct LineEchoConnection {
    link_id: u64,
    last_line: Option<String>,
}

#[async_trait]
impl ProtocolConnection for LineEchoConnection {
    fn on_start_connection(&mut self) {
        self.last_line = None;
    }

    async fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool> {
        let mut line = String::new();
        if ctx.read_stream().read_line(&mut line).await? == 0 {
            return Ok(false);
        }
        let text = line.trim_end_matches(['\r', '\n']);
        tracing::trace!(link_id = self.link_id, line = text, "echo request");

        let mut out = ctx.write_stream().await;
        if text == "quit" {
            out.write_all(b"bye\n").await?;
            return Ok(false);
        }
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n").await?;
        drop(out);

        self.last_line = Some(text.to_string());
        Ok(true)
    }

    fn protocol_request_url(&self) -> Option<String> {
        self.last_line.as_ref().map(|line| format!("echo:{line}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections_start_without_a_request() {
        let conn = LineEchoProtocol.create_connection(7);
        assert_eq!(conn.protocol_request_url(), None);
        assert_eq!(LineEchoProtocol.protocol_name(), "echo");
    }
}
