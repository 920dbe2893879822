//! # courier-client
//!
//! Offline-resilient client runtime for Courier messaging.
//!
//! - **Outbox**: write-ahead queue of unconfirmed messages with a bounded
//!   retry budget
//! - **Transport**: one websocket session to the relay with reconnect and
//!   backoff, multiplexing requests and pushes
//! - **Presence**: per-peer liveness from relay events, local heartbeat
//! - **Sync engine**: coalesced passes that drain the outbox, fetch missed
//!   messages and reconcile them against optimistic entries
//! - **Messenger**: wires the above together behind one handle and an event
//!   subscription

pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod messenger;
pub mod outbox;
pub mod presence;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ClientError, EnqueueError, LinkError};
pub use events::{ClientEvent, EventBus, InboundEvent, Subscription};
pub use messenger::Messenger;
pub use presence::{PeerPresence, PeerState};
pub use sync::SyncReport;
pub use transport::ConnectionState;

use tracing_subscriber::{fmt, EnvFilter};

/// Install a `fmt` subscriber honouring `RUST_LOG`. For embedding apps that
/// have no subscriber of their own; a second call is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("courier_client=debug,courier_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
