//! Conversation directory.
//!
//! Conversation ids are opaque and allocated here exactly once per
//! participant pair. Layout in the backing [`KvStore`]:
//!
//! - `pair/{hex(lo)}/{hex(hi)}` → conversation id (`lo < hi`)
//! - `conv/{id}` → [`ConversationRecord`] JSON
//! - `member/{hex(user)}/{id}` → per-user archived flag (`"0"` / `"1"`)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use courier_shared::{ConversationId, ConversationSummary, UserId};

use crate::error::{Result, ServerError};
use crate::kv::KvStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    /// Canonically ordered participant pair.
    pub participants: [UserId; 2],
    pub created_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn includes(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    /// The other participant, or `None` if `user_id` is not in this
    /// conversation.
    pub fn peer_of(&self, user_id: &UserId) -> Option<&UserId> {
        match &self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

pub struct ConversationDirectory {
    kv: Arc<dyn KvStore>,
}

fn pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("pair/{}/{}", lo.to_key(), hi.to_key())
}

fn conv_key(id: &ConversationId) -> String {
    format!("conv/{id}")
}

fn member_prefix(user_id: &UserId) -> String {
    format!("member/{}/", user_id.to_key())
}

fn member_key(user_id: &UserId, id: &ConversationId) -> String {
    format!("{}{id}", member_prefix(user_id))
}

impl ConversationDirectory {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Look up the conversation for `{a, b}`, allocating it on first use.
    /// Returns the record and whether it was created by this call.
    pub async fn open(&self, a: &UserId, b: &UserId) -> Result<(ConversationRecord, bool)> {
        if a.is_empty() || b.is_empty() {
            return Err(ServerError::BadRequest("empty participant id".into()));
        }
        if a == b {
            return Err(ServerError::BadRequest(
                "a conversation needs two distinct participants".into(),
            ));
        }

        let pair = pair_key(a, b);
        if let Some(existing) = self.resolve_pair(&pair).await? {
            return Ok((existing, false));
        }

        let mut participants = [a.clone(), b.clone()];
        participants.sort();
        let record = ConversationRecord {
            id: ConversationId::generate(),
            participants,
            created_at: Utc::now(),
        };

        // Record and memberships first, then claim the pair. Whoever sees the
        // pair also sees both memberships.
        self.kv
            .set(&conv_key(&record.id), &serde_json::to_string(&record)?)
            .await?;
        for user in &record.participants {
            self.kv.set(&member_key(user, &record.id), "0").await?;
        }

        if !self
            .kv
            .compare_and_swap(&pair, None, Some(record.id.as_str()))
            .await?
        {
            self.discard(&record).await;
            return match self.resolve_pair(&pair).await? {
                Some(winner) => Ok((winner, false)),
                None => Err(ServerError::Internal(format!(
                    "conversation pair {pair} vanished during allocation"
                ))),
            };
        }

        info!(conversation = %record.id, "Conversation allocated");
        Ok((record, true))
    }

    /// Remove a record that lost the race for its pair. Leftovers are
    /// harmless: listings only include conversations that own their pair.
    async fn discard(&self, record: &ConversationRecord) {
        let mut keys: Vec<String> = record
            .participants
            .iter()
            .map(|user| member_key(user, &record.id))
            .collect();
        keys.push(conv_key(&record.id));

        for key in keys {
            if let Err(e) = self.kv.delete(&key).await {
                warn!(conversation = %record.id, error = %e, "Failed to discard unclaimed conversation");
            }
        }
    }

    async fn resolve_pair(&self, pair: &str) -> Result<Option<ConversationRecord>> {
        match self.kv.get(pair).await? {
            Some(id) => self.get(&ConversationId(id)).await,
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: &ConversationId) -> Result<Option<ConversationRecord>> {
        match self.kv.get(&conv_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Resolve `id` and check that `user_id` participates in it.
    pub async fn get_for(
        &self,
        id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| ServerError::ConversationNotFound(id.clone()))?;
        if !record.includes(user_id) {
            return Err(ServerError::Forbidden(format!(
                "not a participant of conversation {id}"
            )));
        }
        Ok(record)
    }

    /// Conversations `user_id` participates in, as that user sees them.
    pub async fn conversations_for(&self, user_id: &UserId) -> Result<Vec<ConversationSummary>> {
        let prefix = member_prefix(user_id);
        let mut summaries = Vec::new();

        for (key, flag) in self.kv.scan_prefix(&prefix).await? {
            let id = ConversationId(key[prefix.len()..].to_string());
            let Some(record) = self.get(&id).await? else {
                continue;
            };
            let [lo, hi] = &record.participants;
            if self.kv.get(&pair_key(lo, hi)).await?.as_deref() != Some(id.as_str()) {
                continue;
            }
            if let Some(peer) = record.peer_of(user_id) {
                summaries.push(ConversationSummary {
                    conversation_id: id,
                    peer_id: peer.clone(),
                    archived: flag == "1",
                });
            }
        }

        Ok(summaries)
    }

    /// Everyone `user_id` shares a conversation with.
    pub async fn peers_of(&self, user_id: &UserId) -> Result<Vec<UserId>> {
        Ok(self
            .conversations_for(user_id)
            .await?
            .into_iter()
            .map(|s| s.peer_id)
            .collect())
    }

    pub async fn summary_for(
        &self,
        record: &ConversationRecord,
        user_id: &UserId,
    ) -> Result<ConversationSummary> {
        let peer = record.peer_of(user_id).ok_or_else(|| {
            ServerError::Forbidden(format!("not a participant of conversation {}", record.id))
        })?;
        let archived = self
            .kv
            .get(&member_key(user_id, &record.id))
            .await?
            .is_some_and(|flag| flag == "1");
        Ok(ConversationSummary {
            conversation_id: record.id.clone(),
            peer_id: peer.clone(),
            archived,
        })
    }

    /// Per-user archive flag; the other participant is unaffected.
    pub async fn set_archived(
        &self,
        user_id: &UserId,
        id: &ConversationId,
        archived: bool,
    ) -> Result<()> {
        self.get_for(id, user_id).await?;
        self.kv
            .set(&member_key(user_id, id), if archived { "1" } else { "0" })
            .await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::kv::MemoryKv;

    fn directory() -> ConversationDirectory {
        ConversationDirectory::new(Arc::new(MemoryKv::new()))
    }

    /// Yields before every operation so concurrent callers interleave.
    #[derive(Default)]
    struct YieldingKv {
        inner: MemoryKv,
    }

    #[async_trait]
    impl KvStore for YieldingKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.delete(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            new: Option<&str>,
        ) -> Result<bool> {
            tokio::task::yield_now().await;
            self.inner.compare_and_swap(key, expected, new).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
            tokio::task::yield_now().await;
            self.inner.scan_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_open_allocates_once_with_membership() {
        let dir = ConversationDirectory::new(Arc::new(YieldingKv::default()));
        let a = UserId::new("alice");
        let b = UserId::new("bob");

        let (first, second) = tokio::join!(dir.open(&a, &b), dir.open(&b, &a));
        let (first, first_created) = first.unwrap();
        let (second, second_created) = second.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first_created != second_created);

        for user in [&a, &b] {
            let listed = dir.conversations_for(user).await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].conversation_id, first.id);
        }
        assert_eq!(dir.peers_of(&a).await.unwrap(), vec![b.clone()]);
    }

    #[tokio::test]
    async fn test_unclaimed_record_is_not_listed() {
        let kv = Arc::new(MemoryKv::new());
        let dir = ConversationDirectory::new(kv.clone());
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        let (claimed, _) = dir.open(&a, &b).await.unwrap();

        // A losing allocation whose cleanup never ran.
        let orphan = ConversationRecord {
            id: ConversationId("c_orphan".into()),
            participants: claimed.participants.clone(),
            created_at: Utc::now(),
        };
        kv.set(&conv_key(&orphan.id), &serde_json::to_string(&orphan).unwrap())
            .await
            .unwrap();
        kv.set(&member_key(&a, &orphan.id), "0").await.unwrap();

        let listed = dir.conversations_for(&a).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].conversation_id, claimed.id);
    }

    #[tokio::test]
    async fn test_open_is_symmetric_and_stable() {
        let dir = directory();
        let a = UserId::new("alice_smith@example.com");
        let b = UserId::new("bob_jones@example.com");

        let (first, created) = dir.open(&a, &b).await.unwrap();
        assert!(created);
        let (again, created) = dir.open(&b, &a).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);
        assert_eq!(first.peer_of(&a), Some(&b));
        assert_eq!(first.peer_of(&b), Some(&a));
    }

    #[tokio::test]
    async fn test_delimiter_heavy_ids_do_not_collide() {
        let dir = directory();
        // Underscore-joined these would both read "a_b_c".
        let (x, _) = dir
            .open(&UserId::new("a_b"), &UserId::new("c"))
            .await
            .unwrap();
        let (y, _) = dir
            .open(&UserId::new("a"), &UserId::new("b_c"))
            .await
            .unwrap();
        assert_ne!(x.id, y.id);
    }

    #[tokio::test]
    async fn test_rejects_self_conversation() {
        let dir = directory();
        let a = UserId::new("alice");
        assert!(matches!(
            dir.open(&a, &a).await,
            Err(ServerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_membership_and_archive_are_per_user() {
        let dir = directory();
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        let c = UserId::new("carol");
        let (ab, _) = dir.open(&a, &b).await.unwrap();
        dir.open(&a, &c).await.unwrap();

        assert_eq!(dir.conversations_for(&a).await.unwrap().len(), 2);
        assert_eq!(dir.peers_of(&b).await.unwrap(), vec![a.clone()]);

        dir.set_archived(&a, &ab.id, true).await.unwrap();
        let for_a = dir.summary_for(&ab, &a).await.unwrap();
        let for_b = dir.summary_for(&ab, &b).await.unwrap();
        assert!(for_a.archived);
        assert!(!for_b.archived);

        assert!(matches!(
            dir.get_for(&ab.id, &c).await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            dir.get_for(&ConversationId("c_missing".into()), &a).await,
            Err(ServerError::ConversationNotFound(_))
        ));
    }
}
