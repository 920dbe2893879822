//! # courier-store
//!
//! Client-resident durable storage for the Courier messaging runtime, backed
//! by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the outbox of
//! not-yet-confirmed messages, the confirmed message history, and the
//! per-conversation sync cursors. Every outbox mutation is a single-row
//! statement guarded by the row's expected status.

pub mod database;
pub mod history;
pub mod migrations;
pub mod models;
pub mod outbox;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
