//! Mirror of presence "last seen" into the user-profile collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use courier_shared::UserId;

/// Best-effort sink. Implementations swallow their own failures; callers
/// never wait on or retry a write.
#[async_trait]
pub trait ProfileSink: Send + Sync {
    async fn record_last_seen(&self, user_id: &UserId, last_seen: DateTime<Utc>);
}

/// Default sink for deployments without a profile service: log only.
pub struct TracingProfileSink;

#[async_trait]
impl ProfileSink for TracingProfileSink {
    async fn record_last_seen(&self, user_id: &UserId, last_seen: DateTime<Utc>) {
        debug!(user = %user_id, %last_seen, "Profile last-seen updated");
    }
}
