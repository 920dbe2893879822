//! # courier-server
//!
//! Relay for the Courier messaging subsystem.
//!
//! - **Session table**: one addressable websocket session per user, with
//!   compare-and-swap supersede over a pluggable key-value store
//! - **Conversation directory**: opaque, relay-assigned conversation ids
//!   looked up from the participant pair
//! - **Message store**: durable, idempotent appends stamped by a strictly
//!   increasing clock
//! - **Presence**: activity-driven liveness with a timeout sweeper
//! - **HTTP surface** (axum): health, info, websocket upgrade and admin

pub mod api;
pub mod config;
pub mod conversations;
pub mod error;
pub mod kv;
pub mod message_store;
pub mod presence;
pub mod profile;
pub mod rate_limit;
pub mod relay;
pub mod sessions;
pub mod ws;

pub use api::{build_router, AppState};
pub use config::ServerConfig;
pub use error::ServerError;
pub use relay::{HubSettings, RelayHub};
