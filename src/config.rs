//! Transport configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4000;

/// Original gateway default: ping every 12 s, pong due within 12 s.
pub const DEFAULT_KEEPALIVE_MS: i64 = 12_000;

pub const DEFAULT_CONNECTION_INIT_TIMEOUT_MS: u64 = 3_000;

pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Keepalive interval. `None` disables liveness probing entirely.
    pub keepalive: Option<Duration>,
    /// How long a connection may stay uninitialised before close 4408.
    pub connection_init_timeout: Duration,
    /// Bound on the shutdown drain wait.
    pub shutdown_grace: Duration,
    /// Suppresses non-fatal diagnostics such as the deprecated-subprotocol
    /// warning.
    pub production: bool,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 4000
    /// - `WS_KEEPALIVE_MS`: default 12000; zero or negative disables
    /// - `CONNECTION_INIT_TIMEOUT_MS`: default 3000
    /// - `SHUTDOWN_GRACE_MS`: default 5000
    /// - `APP_ENV`: `production` suppresses deprecation diagnostics
    #[must_use]
    pub fn from_env() -> Self {
        let keepalive_ms = env_parse("WS_KEEPALIVE_MS", DEFAULT_KEEPALIVE_MS);
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            keepalive: keepalive_interval(keepalive_ms),
            connection_init_timeout: Duration::from_millis(env_parse(
                "CONNECTION_INIT_TIMEOUT_MS",
                DEFAULT_CONNECTION_INIT_TIMEOUT_MS,
            )),
            shutdown_grace: Duration::from_millis(env_parse(
                "SHUTDOWN_GRACE_MS",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )),
            production: std::env::var("APP_ENV").is_ok_and(|v| v == "production"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            keepalive: keepalive_interval(DEFAULT_KEEPALIVE_MS),
            connection_init_timeout: Duration::from_millis(DEFAULT_CONNECTION_INIT_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            production: false,
        }
    }
}

/// Keepalive is disabled for zero or negative intervals.
fn keepalive_interval(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().filter(|ms| *ms > 0).map(Duration::from_millis)
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
