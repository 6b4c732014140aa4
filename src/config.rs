//! Configuration types and constants for the nudge daemon.

use std::time::Duration;

use clap::Parser;

pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:4870";

/// How long a `(event, subscriber)` dedup record is retained.  Must exceed
/// the worst-case delay for the same event to arrive via every relay.
pub(crate) const DEFAULT_DEDUP_RETENTION_SECS: u64 = 60;

pub(crate) const DEFAULT_RECONNECT_DELAY_SECS: u64 = 2;
pub(crate) const DEFAULT_RECONNECT_MAX_DELAY_SECS: u64 = 60;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 10;

/// Relay-to-push notification bridge.
///
/// Keeps WebSocket subscriptions open against every relay referenced by a
/// registered subscriber and forwards matching events to each subscriber's
/// push endpoint.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "nudge", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: NUDGE_BIND] [default: 127.0.0.1:4870]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Dedup retention window in seconds [env: NUDGE_DEDUP_RETENTION_SECS] [default: 60]
    #[arg(long)]
    pub dedup_retention_secs: Option<u64>,

    /// Initial relay reconnect delay in seconds [env: NUDGE_RECONNECT_DELAY_SECS] [default: 2]
    #[arg(long)]
    pub reconnect_delay_secs: Option<u64>,

    /// Maximum relay reconnect delay in seconds [env: NUDGE_RECONNECT_MAX_DELAY_SECS] [default: 60]
    #[arg(long)]
    pub reconnect_max_delay_secs: Option<u64>,

    /// Relay connect timeout in seconds [env: NUDGE_CONNECT_TIMEOUT_SECS] [default: 10]
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Push delivery timeout in seconds [env: NUDGE_PUSH_TIMEOUT_SECS] [default: 10]
    #[arg(long)]
    pub push_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub dedup_retention_secs: u64,
    pub reconnect_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub push_timeout_secs: u64,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("NUDGE_BIND").ok())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        Self {
            bind_addr,
            dedup_retention_secs: secs_setting(
                cli.dedup_retention_secs,
                "NUDGE_DEDUP_RETENTION_SECS",
                DEFAULT_DEDUP_RETENTION_SECS,
            ),
            reconnect_delay_secs: secs_setting(
                cli.reconnect_delay_secs,
                "NUDGE_RECONNECT_DELAY_SECS",
                DEFAULT_RECONNECT_DELAY_SECS,
            ),
            reconnect_max_delay_secs: secs_setting(
                cli.reconnect_max_delay_secs,
                "NUDGE_RECONNECT_MAX_DELAY_SECS",
                DEFAULT_RECONNECT_MAX_DELAY_SECS,
            ),
            connect_timeout_secs: secs_setting(
                cli.connect_timeout_secs,
                "NUDGE_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            ),
            push_timeout_secs: secs_setting(
                cli.push_timeout_secs,
                "NUDGE_PUSH_TIMEOUT_SECS",
                DEFAULT_PUSH_TIMEOUT_SECS,
            ),
        }
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}

fn secs_setting(cli_value: Option<u64>, env_var: &str, default: u64) -> u64 {
    cli_value
        .or_else(|| std::env::var(env_var).ok().and_then(|v| v.parse().ok()))
        .unwrap_or(default)
}
