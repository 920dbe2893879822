/// Application name
pub const APP_NAME: &str = "Courier";

/// Websocket path on the relay
pub const WS_PATH: &str = "/ws";

/// Default HTTP/websocket port (relay)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Maximum message content length in bytes (64 KiB)
pub const MAX_CONTENT_LEN: usize = 65_536;

/// Heartbeat interval in seconds, client and relay
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Missed heartbeats before the relay declares a user offline
pub const PRESENCE_MISSED_BEATS: u32 = 3;

/// Periodic sync pass interval in seconds
pub const SYNC_INTERVAL_SECS: u64 = 30;

/// Delivery attempts before an outbox entry is marked failed
pub const MAX_RETRIES: u32 = 5;

/// Reconnect attempts before the transport gives up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Upper bound on messages returned by one fetch
pub const MAX_FETCH_LIMIT: usize = 500;

/// Page size the sync engine asks for
pub const SYNC_PAGE_SIZE: usize = 200;

/// How long a `sent` outbox entry is kept after confirmation (seconds)
pub const SENT_GRACE_SECS: i64 = 300;
