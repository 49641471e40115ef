//! Linkport line-echo server.
//!
//! Serves [`LineEchoProtocol`] on the configured address until interrupted
//! or until a link reports a fatal error.

use std::{net::IpAddr, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use linkport_core::{ListenerConfig, parse_period};
use linkport_server::{LineEchoProtocol, Listener, ReactorSelectManager};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Line-echo server on the linkport connection engine
#[derive(Parser, Debug)]
#[command(name = "linkport-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind; all interfaces when omitted
    #[arg(long)]
    address: Option<IpAddr>,

    /// Port to bind
    #[arg(long)]
    port: Option<u16>,

    /// Acceptors kept starting or idle
    #[arg(long)]
    accept_thread_min: Option<usize>,

    /// Acceptors allowed to wait in accept at once
    #[arg(long)]
    accept_thread_max: Option<usize>,

    /// Listen backlog of the TCP socket
    #[arg(long)]
    accept_listen_backlog: Option<u32>,

    /// Ceiling on links holding a connection or an acceptor
    #[arg(long)]
    connection_max: Option<usize>,

    /// Ceiling on keepalive slots
    #[arg(long)]
    keepalive_max: Option<usize>,

    /// Connections older than this are not kept alive
    #[arg(long, value_parser = period)]
    keepalive_connection_time_max: Option<Duration>,

    /// Idle limit between keepalive requests
    #[arg(long, value_parser = period)]
    keepalive_timeout: Option<Duration>,

    /// Hand idle keepalive connections to the select manager
    #[arg(long)]
    keepalive_select_enable: Option<bool>,

    /// Quick read before a keepalive hand-off
    #[arg(long, value_parser = period)]
    keepalive_select_thread_timeout: Option<Duration>,

    /// Bound on a single blocking read
    #[arg(long, value_parser = period)]
    socket_timeout: Option<Duration>,

    /// Longest comet suspension
    #[arg(long, value_parser = period)]
    suspend_time_max: Option<Duration>,

    /// Suspension after which a closed peer completes the request
    #[arg(long, value_parser = period)]
    suspend_close_time_max: Option<Duration>,

    /// Period of the suspend reaper
    #[arg(long, value_parser = period)]
    suspend_reaper_interval: Option<Duration>,

    /// Ceiling on concurrently admitted connections
    #[arg(long)]
    throttle_concurrent_max: Option<usize>,

    /// Set `TCP_NODELAY` on accepted sockets
    #[arg(long)]
    tcp_no_delay: Option<bool>,

    /// Worker pool size
    #[arg(long)]
    worker_max: Option<usize>,

    /// Idle links kept for reuse
    #[arg(long)]
    free_list_capacity: Option<usize>,

    /// Report connections as secure (TLS terminated upstream)
    #[arg(long)]
    secure: bool,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn period(text: &str) -> Result<Duration, String> {
    parse_period(text).map_err(|e| e.to_string())
}

impl Args {
    fn config(&self) -> ListenerConfig {
        let mut config = ListenerConfig { address: self.address, ..ListenerConfig::default() };
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field { config.$field = value; })*
            };
        }
        overlay!(
            port,
            accept_thread_min,
            accept_thread_max,
            accept_listen_backlog,
            connection_max,
            keepalive_max,
            keepalive_connection_time_max,
            keepalive_timeout,
            keepalive_select_enable,
            keepalive_select_thread_timeout,
            socket_timeout,
            suspend_time_max,
            suspend_close_time_max,
            suspend_reaper_interval,
            tcp_no_delay,
            worker_max,
            free_list_capacity,
        );
        if self.throttle_concurrent_max.is_some() {
            config.throttle_concurrent_max = self.throttle_concurrent_max;
        }
        config.secure = self.secure;
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.config();
    let select = Arc::new(ReactorSelectManager::new(config.connection_max));
    let listener = match Listener::builder(config, Arc::new(LineEchoProtocol))
        .select_manager(select)
        .build()
    {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = listener.bind().and_then(|_| listener.start()) {
        error!(listener = listener.url(), error = %e, "cannot start");
        return ExitCode::FAILURE;
    }

    let mut fatal = listener.fatal_events();
    let code = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "cannot listen for ctrl-c");
            }
            info!(listener = listener.url(), "shutting down");
            ExitCode::SUCCESS
        },
        () = wait_fatal(&mut fatal) => ExitCode::FAILURE,
    };

    listener.close().await;
    code
}

/// Resolves once a link reports a fatal error.
async fn wait_fatal(fatal: &mut tokio::sync::watch::Receiver<Option<linkport_server::FatalEvent>>) {
    while fatal.changed().await.is_ok() {
        if let Some(event) = fatal.borrow().clone() {
            error!(link_id = event.link_id, reason = %event.reason, "fatal link error, exiting");
            return;
        }
    }
    std::future::pending::<()>().await;
}
