//! Listener configuration.
//!
//! [`ListenerConfig`] carries every option the listener recognizes, with
//! defaults tuned for a general-purpose server. Durations use the period
//! syntax accepted by [`parse_period`].

use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default keepalive ceiling when none is configured.
pub const DEFAULT_KEEPALIVE_MAX: usize = 256;

/// Listener options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ListenerConfig {
    /// Bind address. `None` binds the wildcard address.
    pub address: Option<IpAddr>,
    /// Bind port. Zero picks an ephemeral port.
    pub port: u16,
    /// Acceptors kept parked in accept.
    pub accept_thread_min: usize,
    /// Idle acceptors above this count exit instead of parking.
    pub accept_thread_max: usize,
    /// Listen backlog passed to the OS at bind.
    pub accept_listen_backlog: u32,
    /// Ceiling on concurrently active links.
    pub connection_max: usize,
    /// Ceiling on keepalive slots held across all links.
    pub keepalive_max: usize,
    /// A connection older than this is not kept alive.
    pub keepalive_connection_time_max: Duration,
    /// Idle time allowed between keepalive requests.
    pub keepalive_timeout: Duration,
    /// Hand idle keepalive sockets to the select manager when one is set.
    pub keepalive_select_enable: bool,
    /// Quick read performed by the worker before the select hand-off.
    pub keepalive_select_thread_timeout: Duration,
    /// Read and write timeout on an active connection.
    pub socket_timeout: Duration,
    /// Longest a comet request may stay suspended.
    pub suspend_time_max: Duration,
    /// Suspended links older than this are probed for a closed peer.
    pub suspend_close_time_max: Duration,
    /// Period of the suspend reaper.
    pub suspend_reaper_interval: Duration,
    /// Ceiling on concurrently accepted connections. `None` is unlimited.
    pub throttle_concurrent_max: Option<usize>,
    /// Disable Nagle on accepted TCP sockets.
    pub tcp_no_delay: bool,
    /// Ceiling on worker tasks, acceptors included.
    pub worker_max: usize,
    /// Closed links kept for reuse.
    pub free_list_capacity: usize,
    /// Report connections as secure even without a TLS factory.
    pub secure: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: 8080,
            accept_thread_min: 2,
            accept_thread_max: 8,
            accept_listen_backlog: 100,
            connection_max: 1024 * 1024,
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
            keepalive_connection_time_max: Duration::from_secs(10 * 60),
            keepalive_timeout: Duration::from_secs(120),
            keepalive_select_enable: true,
            keepalive_select_thread_timeout: Duration::from_secs(1),
            socket_timeout: Duration::from_secs(120),
            suspend_time_max: Duration::from_secs(600),
            suspend_close_time_max: Duration::from_secs(120),
            suspend_reaper_interval: Duration::from_secs(60),
            throttle_concurrent_max: None,
            tcp_no_delay: true,
            worker_max: 4096,
            free_list_capacity: 32,
            secure: false,
        }
    }
}

impl ListenerConfig {
    /// Check option constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("accept-thread-min", self.accept_thread_min as u64, 1)?;
        if self.accept_thread_max < self.accept_thread_min {
            return Err(ConfigError::AcceptThreadRange {
                min: self.accept_thread_min,
                max: self.accept_thread_max,
            });
        }
        at_least("accept-listen-backlog", u64::from(self.accept_listen_backlog), 1)?;
        at_least("connection-max", self.connection_max as u64, 1)?;
        if let Some(max) = self.throttle_concurrent_max {
            at_least("throttle-concurrent-max", max as u64, 1)?;
        }
        at_least(
            "suspend-reaper-interval",
            u64::try_from(self.suspend_reaper_interval.as_millis()).unwrap_or(u64::MAX),
            1,
        )?;
        if self.worker_max <= self.accept_thread_max {
            return Err(ConfigError::WorkerPoolTooSmall {
                worker_max: self.worker_max,
                accept_thread_max: self.accept_thread_max,
            });
        }
        Ok(())
    }

    /// Debug URL of a listener, `<scheme>://<address|*>:<port>`.
    pub fn url(&self, scheme: &str) -> String {
        match self.address {
            Some(IpAddr::V6(addr)) => format!("{scheme}://[{addr}]:{}", self.port),
            Some(addr) => format!("{scheme}://{addr}:{}", self.port),
            None => format!("{scheme}://*:{}", self.port),
        }
    }
}

fn at_least(option: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min { Err(ConfigError::TooSmall { option, min, value }) } else { Ok(()) }
}

/// Parse a period such as `500ms`, `30s`, `10m`, `2h`, `1d` or `1w`.
///
/// A bare number is milliseconds.
///
/// # Errors
///
/// Returns `InvalidPeriod` for an empty string, an unknown unit, or a value
/// that overflows.
pub fn parse_period(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidPeriod(text.to_string());
    let trimmed = text.trim();

    let split = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let millis_per_unit: u64 = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        "w" => 7 * 24 * 60 * 60 * 1000,
        _ => return Err(invalid()),
    };

    value.checked_mul(millis_per_unit).map(Duration::from_millis).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ListenerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keepalive_max, 256);
        assert_eq!(config.accept_thread_min, 2);
        assert_eq!(config.accept_thread_max, 8);
        assert_eq!(config.free_list_capacity, 32);
    }

    #[test]
    fn rejects_zero_acceptors() {
        let config = ListenerConfig { accept_thread_min: 0, ..ListenerConfig::default() };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooSmall { option: "accept-thread-min", min: 1, value: 0 })
        );
    }

    #[test]
    fn rejects_inverted_acceptor_range() {
        let config = ListenerConfig {
            accept_thread_min: 4,
            accept_thread_max: 2,
            ..ListenerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::AcceptThreadRange { min: 4, max: 2 }));
    }

    #[test]
    fn rejects_worker_pool_without_room_for_requests() {
        let config = ListenerConfig { worker_max: 8, ..ListenerConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::WorkerPoolTooSmall { .. })));
    }

    #[test]
    fn rejects_zero_throttle() {
        let config =
            ListenerConfig { throttle_concurrent_max: Some(0), ..ListenerConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_reaper_interval() {
        let config =
            ListenerConfig { suspend_reaper_interval: Duration::ZERO, ..ListenerConfig::default() };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooSmall { option: "suspend-reaper-interval", min: 1, value: 0 })
        );
    }

    #[test]
    fn url_uses_wildcard_without_address() {
        let config = ListenerConfig::default();
        assert_eq!(config.url("echo"), "echo://*:8080");

        let config = ListenerConfig {
            address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 80,
            ..ListenerConfig::default()
        };
        assert_eq!(config.url("http"), "http://127.0.0.1:80");
    }

    #[test]
    fn parses_periods() {
        assert_eq!(parse_period("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_period("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_period("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_period("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_period("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_period(" 1d ").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn rejects_bad_periods() {
        assert!(parse_period("").is_err());
        assert!(parse_period("s").is_err());
        assert!(parse_period("10 parsecs").is_err());
        assert!(parse_period("99999999999999999999d").is_err());
    }
}
