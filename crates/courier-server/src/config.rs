//! Relay configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_HTTP_PORT, HEARTBEAT_INTERVAL_SECS, PRESENCE_MISSED_BEATS};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + websocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file holding confirmed messages and the conversation directory.
    /// Env: `RELAY_DB_PATH`
    /// Default: `./relay.db`
    pub db_path: PathBuf,

    /// Human-readable name for this relay instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Expected client heartbeat period.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    /// Default: `30`
    pub heartbeat_interval: Duration,

    /// Heartbeat periods without activity before a user is declared offline.
    /// Env: `PRESENCE_MISSED_BEATS`
    /// Default: `3`
    pub presence_missed_beats: u32,

    /// Maximum number of concurrently authenticated users (0 = unlimited).
    /// Env: `MAX_SESSIONS`
    pub max_sessions: usize,

    /// Sustained per-user send rate (messages per second).
    /// Env: `SEND_RATE_PER_SEC`
    pub send_rate_per_sec: f64,

    /// Per-user send burst.
    /// Env: `SEND_BURST`
    pub send_burst: f64,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            db_path: PathBuf::from("./relay.db"),
            instance_name: "Courier Relay".to_string(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            presence_missed_beats: PRESENCE_MISSED_BEATS,
            max_sessions: 0,
            send_rate_per_sec: 5.0,
            send_burst: 20.0,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("RELAY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "HEARTBEAT_INTERVAL_SECS") {
            if secs == 0 {
                tracing::warn!("HEARTBEAT_INTERVAL_SECS must be positive, using default");
            } else {
                config.heartbeat_interval = Duration::from_secs(secs);
            }
        }

        if let Some(beats) = parse_var::<u32>(&lookup, "PRESENCE_MISSED_BEATS") {
            config.presence_missed_beats = beats.max(1);
        }

        if let Some(n) = parse_var(&lookup, "MAX_SESSIONS") {
            config.max_sessions = n;
        }

        if let Some(rate) = parse_var(&lookup, "SEND_RATE_PER_SEC") {
            config.send_rate_per_sec = rate;
        }

        if let Some(burst) = parse_var(&lookup, "SEND_BURST") {
            config.send_burst = burst;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Silence after which a user is considered offline.
    pub fn presence_timeout(&self) -> Duration {
        self.heartbeat_interval * self.presence_missed_beats
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.presence_timeout(), Duration::from_secs(90));
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("HEARTBEAT_INTERVAL_SECS", "10"),
            ("PRESENCE_MISSED_BEATS", "2"),
            ("MAX_SESSIONS", "100"),
            ("ADMIN_TOKEN", "secret"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.presence_timeout(), Duration::from_secs(20));
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("HEARTBEAT_INTERVAL_SECS", "0"),
            ("SEND_BURST", "lots"),
            ("ADMIN_TOKEN", ""),
        ]));
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.send_burst, 20.0);
        assert!(config.admin_token.is_none());
    }
}
