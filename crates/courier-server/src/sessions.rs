//! Session table: at most one addressable session per user.
//!
//! The `user → SessionRecord` mapping lives in a [`KvStore`] and is replaced
//! with compare-and-swap, so a new login atomically supersedes the old one.
//! The outbound channel of each session is process-local and keyed by
//! session id; a superseded session keeps its socket but is no longer
//! reachable through the table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use courier_shared::{ServerFrame, UserId};

use crate::error::Result;
use crate::kv::KvStore;

/// Outbound half of a connection.
pub type SessionSender = mpsc::Sender<ServerFrame>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub display_name: String,
    pub authenticated_at: DateTime<Utc>,
}

/// A connection's claim to be `user_id`'s current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub user_id: UserId,
    pub session_id: String,
}

pub struct SessionTable {
    kv: Arc<dyn KvStore>,
    local: RwLock<HashMap<String, SessionSender>>,
}

fn session_key(user_id: &UserId) -> String {
    format!("session/{}", user_id.to_key())
}

impl SessionTable {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Install a fresh session for `user_id`, superseding any existing one.
    /// Returns the new handle and the record it replaced, if any.
    pub async fn register(
        &self,
        user_id: &UserId,
        display_name: &str,
        sender: SessionSender,
    ) -> Result<(SessionHandle, Option<SessionRecord>)> {
        let key = session_key(user_id);
        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            authenticated_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&record)?;

        // Insert the handle first so the session is reachable the moment the
        // record becomes visible.
        self.local
            .write()
            .await
            .insert(record.session_id.clone(), sender);

        let previous = loop {
            let current = self.kv.get(&key).await?;
            if self
                .kv
                .compare_and_swap(&key, current.as_deref(), Some(&encoded))
                .await?
            {
                break current;
            }
        };

        let previous = match previous {
            Some(raw) => {
                let old: SessionRecord = serde_json::from_str(&raw)?;
                self.local.write().await.remove(&old.session_id);
                debug!(user = %user_id, old = %old.session_id, "Session superseded");
                Some(old)
            }
            None => None,
        };

        Ok((
            SessionHandle {
                user_id: user_id.clone(),
                session_id: record.session_id,
            },
            previous,
        ))
    }

    pub async fn current(&self, user_id: &UserId) -> Result<Option<SessionRecord>> {
        match self.kv.get(&session_key(user_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Stale-session self check.
    pub async fn is_current(&self, handle: &SessionHandle) -> Result<bool> {
        Ok(self
            .current(&handle.user_id)
            .await?
            .is_some_and(|r| r.session_id == handle.session_id))
    }

    /// Outbound channel of the user's current session, if it lives in this
    /// process.
    pub async fn sender_for(&self, user_id: &UserId) -> Result<Option<SessionSender>> {
        let Some(record) = self.current(user_id).await? else {
            return Ok(None);
        };
        Ok(self.local.read().await.get(&record.session_id).cloned())
    }

    pub async fn is_connected(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.sender_for(user_id).await?.is_some())
    }

    /// Drop a session on disconnect. The table entry is only removed if it
    /// still belongs to this session.
    pub async fn release(&self, handle: &SessionHandle) -> Result<bool> {
        self.local.write().await.remove(&handle.session_id);

        let key = session_key(&handle.user_id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(false);
        };
        let record: SessionRecord = serde_json::from_str(&raw)?;
        if record.session_id != handle.session_id {
            return Ok(false);
        }
        self.kv.compare_and_swap(&key, Some(&raw), None).await
    }

    /// Remove whatever session `user_id` has. The connection stays open
    /// until its next frame fails the current-session check.
    pub async fn evict(&self, user_id: &UserId) -> Result<()> {
        let key = session_key(user_id);
        if let Some(raw) = self.kv.get(&key).await? {
            let record: SessionRecord = serde_json::from_str(&raw)?;
            self.local.write().await.remove(&record.session_id);
            self.kv.compare_and_swap(&key, Some(&raw), None).await?;
        }
        Ok(())
    }

    /// Sessions with a live channel in this process.
    pub async fn active_count(&self) -> usize {
        self.local.read().await.len()
    }
}
