//! Client configuration.
//!
//! [`ClientConfig::new`] gives working defaults; [`ClientConfig::from_env`]
//! overlays `COURIER_*` environment variables on top of them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_HTTP_PORT, HEARTBEAT_INTERVAL_SECS, MAX_RECONNECT_ATTEMPTS, MAX_RETRIES,
    SENT_GRACE_SECS, SYNC_INTERVAL_SECS, SYNC_PAGE_SIZE, WS_PATH,
};
use courier_shared::UserId;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay websocket URL.
    /// Env: `COURIER_RELAY_URL`
    pub relay_url: String,

    /// Identity supplied by the auth collaborator.
    /// Env: `COURIER_USER_ID`
    pub user_id: UserId,

    /// Env: `COURIER_DISPLAY_NAME`
    pub display_name: String,

    /// Local database file; `None` uses the platform data directory.
    /// Env: `COURIER_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Env: `COURIER_HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,

    /// Periodic sync pass while online.
    /// Env: `COURIER_SYNC_INTERVAL_SECS`
    pub sync_interval: Duration,

    /// Bound on each request/response exchange, delivery attempts included.
    pub request_timeout: Duration,

    /// Delivery attempts before an outbox entry is marked failed.
    /// Env: `COURIER_MAX_RETRIES`
    pub max_retries: u32,

    /// Consecutive failed connection attempts before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    /// Pause between outbox deliveries within one pass.
    pub send_delay: Duration,

    /// How long a `sent` outbox entry is kept after confirmation.
    pub sent_grace: Duration,

    /// Messages requested per missed-message fetch.
    pub page_size: usize,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            relay_url: relay_url.into(),
            display_name: user_id.to_string(),
            user_id,
            db_path: None,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            sync_interval: Duration::from_secs(SYNC_INTERVAL_SECS),
            request_timeout: Duration::from_secs(10),
            max_retries: MAX_RETRIES,
            reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            send_delay: Duration::from_millis(150),
            sent_grace: Duration::from_secs(SENT_GRACE_SECS.unsigned_abs()),
            page_size: SYNC_PAGE_SIZE,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let relay_url = lookup("COURIER_RELAY_URL")
            .unwrap_or_else(|| format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}{WS_PATH}"));
        let user_id = UserId::new(lookup("COURIER_USER_ID").unwrap_or_default());
        let mut config = Self::new(relay_url, user_id);

        if let Some(name) = lookup("COURIER_DISPLAY_NAME") {
            config.display_name = name;
        }

        if let Some(path) = lookup("COURIER_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "COURIER_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "COURIER_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(n) = parse_var::<u32>(&lookup, "COURIER_MAX_RETRIES") {
            config.max_retries = n.max(1);
        }

        config
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
