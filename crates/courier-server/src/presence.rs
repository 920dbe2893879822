//! In-memory presence records.
//!
//! Liveness is driven by activity: any heartbeat or authenticated frame
//! refreshes `last_seen`. Nothing here fires on disconnect; users go offline
//! only once [`PresenceTable::expire`] finds them silent for the timeout.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use courier_shared::{PresenceEvent, PresenceStatus, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub status: PresenceStatus,
    /// Last explicit status, restored when the user comes back online.
    pub chosen: PresenceStatus,
}

impl PresenceRecord {
    pub fn to_event(&self) -> PresenceEvent {
        PresenceEvent {
            user_id: self.user_id.clone(),
            is_online: self.is_online,
            last_seen: self.last_seen,
            status: self.status,
        }
    }
}

pub struct PresenceTable {
    records: RwLock<HashMap<UserId, PresenceRecord>>,
    timeout: chrono::Duration,
}

impl PresenceTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
        }
    }

    /// Record activity. Returns the new record if the user just came online.
    pub async fn touch(&self, user_id: &UserId, now: DateTime<Utc>) -> Option<PresenceEvent> {
        let mut records = self.records.write().await;
        match records.get_mut(user_id) {
            Some(record) => {
                record.last_seen = now;
                if record.is_online {
                    return None;
                }
                record.is_online = true;
                record.status = match record.chosen {
                    PresenceStatus::Offline => PresenceStatus::Online,
                    chosen => chosen,
                };
                Some(record.to_event())
            }
            None => {
                let record = PresenceRecord {
                    user_id: user_id.clone(),
                    is_online: true,
                    last_seen: now,
                    status: PresenceStatus::Online,
                    chosen: PresenceStatus::Online,
                };
                let event = record.to_event();
                records.insert(user_id.clone(), record);
                Some(event)
            }
        }
    }

    /// Explicit away/busy/online override. Does not alter liveness.
    pub async fn set_status(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
        now: DateTime<Utc>,
    ) -> PresenceEvent {
        let mut records = self.records.write().await;
        let record = records
            .entry(user_id.clone())
            .or_insert_with(|| PresenceRecord {
                user_id: user_id.clone(),
                is_online: true,
                last_seen: now,
                status,
                chosen: status,
            });
        record.status = status;
        record.chosen = status;
        record.to_event()
    }

    /// Flip every online user silent for longer than the timeout to offline,
    /// freezing `last_seen` and keeping their chosen status for later.
    /// Returns the records that changed.
    pub async fn expire(&self, now: DateTime<Utc>) -> Vec<PresenceEvent> {
        let cutoff = now - self.timeout;
        let mut records = self.records.write().await;
        records
            .values_mut()
            .filter(|r| r.is_online && r.last_seen < cutoff)
            .map(|r| {
                r.is_online = false;
                r.status = PresenceStatus::Offline;
                r.to_event()
            })
            .collect()
    }

    pub async fn get(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.records.read().await.get(user_id).cloned()
    }

    pub async fn online_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.is_online)
            .count()
    }
}
