//! # courier-shared
//!
//! Identifier types, wire protocol frames and constants shared by the
//! Courier client runtime and the relay server.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::CourierError;
pub use protocol::{
    ClientFrame, ConfirmedMessage, ConversationSummary, ErrorCode, PresenceEvent, ServerFrame,
};
pub use types::{ClientId, ConversationId, MessageId, PresenceStatus, UserId};
