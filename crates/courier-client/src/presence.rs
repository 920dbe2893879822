//! Client-side presence tracking.
//!
//! Each peer runs `Unknown → Online → Offline → Online …`, fed by relay
//! presence events. The displayed status (away/busy) rides along and never
//! changes the liveness state on its own.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use courier_shared::{PresenceEvent, PresenceStatus, UserId};

use crate::transport::{ConnectionState, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub user_id: UserId,
    pub state: PeerState,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerPresence {
    fn unknown(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.clone(),
            state: PeerState::Unknown,
            status: PresenceStatus::Offline,
            last_seen: None,
        }
    }
}

pub struct PresenceTracker {
    peers: RwLock<HashMap<UserId, PeerPresence>>,
    own_status: RwLock<PresenceStatus>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            own_status: RwLock::new(PresenceStatus::Online),
        }
    }

    /// Fold one relay event in. Returns the new record when anything a UI
    /// would show has changed.
    pub async fn apply(&self, event: &PresenceEvent) -> Option<PeerPresence> {
        let mut peers = self.peers.write().await;
        let current = peers
            .get(&event.user_id)
            .cloned()
            .unwrap_or_else(|| PeerPresence::unknown(&event.user_id));

        let state = match (current.state, event.is_online) {
            (_, true) => PeerState::Online,
            (PeerState::Online | PeerState::Offline, false) => PeerState::Offline,
            // Nothing was ever seen, so there is nothing to go offline from.
            (PeerState::Unknown, false) => {
                trace!(user = %event.user_id, "Offline event for unseen peer");
                return None;
            }
        };

        let last_seen = match current.last_seen {
            Some(seen) if seen > event.last_seen => Some(seen),
            _ => Some(event.last_seen),
        };

        let next = PeerPresence {
            user_id: event.user_id.clone(),
            state,
            status: event.status,
            last_seen,
        };
        if next == current {
            return None;
        }

        if next.state != current.state {
            debug!(user = %next.user_id, from = ?current.state, to = ?next.state, "Peer presence");
        }
        peers.insert(next.user_id.clone(), next.clone());
        Some(next)
    }

    pub async fn state_of(&self, user_id: &UserId) -> PeerState {
        self.peers
            .read()
            .await
            .get(user_id)
            .map(|p| p.state)
            .unwrap_or(PeerState::Unknown)
    }

    pub async fn get(&self, user_id: &UserId) -> PeerPresence {
        self.peers
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| PeerPresence::unknown(user_id))
    }

    /// Local away/busy override.
    pub async fn set_user_status(&self, status: PresenceStatus) {
        *self.own_status.write().await = status;
    }

    pub async fn user_status(&self) -> PresenceStatus {
        *self.own_status.read().await
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a heartbeat every `interval` while the transport is authenticated,
/// and immediately after each (re)authentication.
pub fn spawn_heartbeat(transport: Transport, interval: Duration) -> JoinHandle<()> {
    let mut state = transport.watch_state();
    tokio::spawn(async move {
        loop {
            // Suspended until a session is up.
            if state
                .wait_for(ConnectionState::is_authenticated)
                .await
                .is_err()
            {
                break;
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if transport.heartbeat().is_err() {
                            // Writer is gone; let the state catch up.
                            if state.changed().await.is_err() {
                                return;
                            }
                            break;
                        }
                        trace!("Heartbeat sent");
                    }
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !state.borrow().is_authenticated() {
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: &str, is_online: bool, status: PresenceStatus, secs: i64) -> PresenceEvent {
        PresenceEvent {
            user_id: UserId::new(user),
            is_online,
            last_seen: DateTime::from_timestamp(secs, 0).unwrap(),
            status,
        }
    }

    #[tokio::test]
    async fn test_unknown_until_seen() {
        let tracker = PresenceTracker::new();
        let bob = UserId::new("bob");
        assert_eq!(tracker.state_of(&bob).await, PeerState::Unknown);

        assert!(tracker
            .apply(&event("bob", false, PresenceStatus::Offline, 10))
            .await
            .is_none());
        assert_eq!(tracker.state_of(&bob).await, PeerState::Unknown);
    }

    #[tokio::test]
    async fn test_online_offline_online() {
        let tracker = PresenceTracker::new();
        let bob = UserId::new("bob");

        let online = tracker
            .apply(&event("bob", true, PresenceStatus::Online, 10))
            .await
            .unwrap();
        assert_eq!(online.state, PeerState::Online);

        let offline = tracker
            .apply(&event("bob", false, PresenceStatus::Offline, 100))
            .await
            .unwrap();
        assert_eq!(offline.state, PeerState::Offline);
        assert_eq!(offline.last_seen.unwrap().timestamp(), 100);

        tracker
            .apply(&event("bob", true, PresenceStatus::Online, 200))
            .await
            .unwrap();
        assert_eq!(tracker.state_of(&bob).await, PeerState::Online);
    }

    #[tokio::test]
    async fn test_status_change_without_liveness_change() {
        let tracker = PresenceTracker::new();
        tracker
            .apply(&event("bob", true, PresenceStatus::Online, 10))
            .await;

        let away = tracker
            .apply(&event("bob", true, PresenceStatus::Away, 10))
            .await
            .unwrap();
        assert_eq!(away.state, PeerState::Online);
        assert_eq!(away.status, PresenceStatus::Away);

        // Same event again changes nothing.
        assert!(tracker
            .apply(&event("bob", true, PresenceStatus::Away, 10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_back() {
        let tracker = PresenceTracker::new();
        tracker
            .apply(&event("bob", true, PresenceStatus::Online, 50))
            .await;
        let stale = tracker
            .apply(&event("bob", false, PresenceStatus::Offline, 20))
            .await
            .unwrap();
        assert_eq!(stale.last_seen.unwrap().timestamp(), 50);
    }

    #[tokio::test]
    async fn test_own_status() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.user_status().await, PresenceStatus::Online);
        tracker.set_user_status(PresenceStatus::Busy).await;
        assert_eq!(tracker.user_status().await, PresenceStatus::Busy);
    }
}
