//! Conversation-set queries, live feeds, and two-party create-or-find.

use std::sync::Arc;

use tracing::{debug, warn};

use talkwave_shared::crypto::generate_symmetric_key;
use talkwave_shared::{Conversation, ConversationId, UserId};
use talkwave_store::KeyStore;

use crate::docs;
use crate::error::{RemoteError, Result};
use crate::store::{Document, DocumentStore, Filter, Query, Subscription};

/// Queries and subscribes to the set of conversations a user participates
/// in, and resolves "conversation between two users" idempotently.
pub struct ConversationIndex {
    store: Arc<dyn DocumentStore>,
    keys: Arc<KeyStore>,
}

impl ConversationIndex {
    pub fn new(store: Arc<dyn DocumentStore>, keys: Arc<KeyStore>) -> Self {
        Self { store, keys }
    }

    /// Resolve the conversation between two users, creating it if absent.
    ///
    /// Scans for an existing two-party conversation containing `a`, then
    /// filters locally for membership of `b`; matching is order-independent
    /// in the pair.  The membership check before creating keeps repeated
    /// sequential calls idempotent; two truly concurrent first calls can
    /// still each create a channel (no transactional guard, matching the
    /// source system).
    ///
    /// A fresh symmetric key is generated and persisted locally for every
    /// conversation this call creates.
    pub async fn find_or_create(&self, a: &UserId, b: &UserId) -> Result<ConversationId> {
        let existing = self
            .store
            .query(
                &Query::collection(docs::CONVERSATIONS)
                    .filter(Filter::array_contains("participants", a.as_str())),
            )
            .await?;

        for doc in &existing {
            let conv = docs::conversation_from_doc(doc)?;
            if conv.participants.len() == 2 && conv.participants.contains(b) {
                debug!(conversation = %conv.id, "found existing conversation");
                return Ok(conv.id);
            }
        }

        let id = self
            .store
            .create(docs::CONVERSATIONS, docs::conversation_fields(a, b))
            .await?;
        let conversation_id = ConversationId(id);

        let key = generate_symmetric_key();
        self.keys.insert(&conversation_id, &key)?;

        debug!(conversation = %conversation_id, "created conversation");
        Ok(conversation_id)
    }

    /// All conversations containing `user`, most recently active first.
    ///
    /// Attempts the indexed query (by participant and by last-message time);
    /// when the store lacks the composite index the call falls back to the
    /// unindexed membership query and sorts client-side.  The fallback is
    /// invisible to the caller: same contract, same ordering.
    pub async fn list(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let raw = match self.store.query(&indexed_query(user)).await {
            Ok(raw) => raw,
            Err(RemoteError::IndexMissing) => {
                warn!("composite index unavailable, using unindexed conversation query");
                self.store.query(&fallback_query(user)).await?
            }
            Err(other) => return Err(other),
        };

        let mut conversations = resolve_conversations(&*self.store, &raw).await?;
        // Harmless after the indexed path; required after the fallback.
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }

    /// Live feed of [`list`](Self::list), pushing a full refreshed snapshot
    /// on every change.  The same indexed/fallback policy applies at
    /// subscription setup.
    ///
    /// Snapshots whose resolution fails are dropped with a logged error,
    /// leaving the consumer on its previous state.  The returned handle
    /// cancels the feed; cancelling after teardown is a no-op.
    pub async fn subscribe<F>(&self, user: &UserId, on_change: F) -> Result<Subscription>
    where
        F: Fn(Vec<Conversation>) + Send + Sync + 'static,
    {
        let (mut rx, sub) = match self.store.subscribe(&indexed_query(user)).await {
            Ok(pair) => pair,
            Err(RemoteError::IndexMissing) => {
                warn!("composite index unavailable, using unindexed conversation feed");
                self.store.subscribe(&fallback_query(user)).await?
            }
            Err(other) => return Err(other),
        };

        let store = Arc::clone(&self.store);
        let handle = sub.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                if handle.is_cancelled() {
                    break;
                }
                match resolve_conversations(&*store, &raw).await {
                    Ok(mut conversations) => {
                        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
                        on_change(conversations);
                    }
                    Err(e) => warn!(error = %e, "dropping unresolvable conversation snapshot"),
                }
            }
            debug!("conversation feed ended");
        });

        Ok(sub)
    }
}

fn indexed_query(user: &UserId) -> Query {
    Query::collection(docs::CONVERSATIONS)
        .filter(Filter::array_contains("participants", user.as_str()))
        .order_by("last_message_at", true)
}

fn fallback_query(user: &UserId) -> Query {
    Query::collection(docs::CONVERSATIONS)
        .filter(Filter::array_contains("participants", user.as_str()))
}

/// Map raw documents and resolve each conversation's participant profiles.
///
/// Resolution is per conversation, per participant (an accepted N+1
/// pattern; the participant count is always exactly two).  Participants
/// with no identity record are skipped in the resolved list, matching the
/// source.
async fn resolve_conversations(
    store: &dyn DocumentStore,
    raw: &[Document],
) -> Result<Vec<Conversation>> {
    let mut conversations = Vec::with_capacity(raw.len());

    for doc in raw {
        let mut conv = docs::conversation_from_doc(doc)?;
        for participant in &conv.participants {
            match store.get(docs::USERS, participant.as_str()).await? {
                Some(profile_doc) => {
                    conv.participant_profiles
                        .push(docs::profile_from_doc(&profile_doc)?);
                }
                None => {
                    debug!(user = %participant, "no identity record for participant");
                }
            }
        }
        conversations.push(conv);
    }

    Ok(conversations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use talkwave_shared::UserProfile;

    use crate::memory::MemoryStore;
    use crate::store::SERVER_TIMESTAMP;

    fn temp_keys() -> (tempfile::TempDir, Arc<KeyStore>) {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyStore::open_at(&dir.path().join("keys.db")).unwrap());
        (dir, keys)
    }

    fn index(store: Arc<MemoryStore>) -> (tempfile::TempDir, ConversationIndex) {
        let (dir, keys) = temp_keys();
        (dir, ConversationIndex::new(store, keys))
    }

    fn seed_profile(store: &MemoryStore, id: &str, name: &str) {
        let profile = UserProfile {
            id: UserId::from(id),
            display_name: name.to_string(),
            avatar_url: None,
            is_online: true,
            last_seen: Utc::now(),
        };
        store.seed(docs::USERS, id, docs::profile_fields(&profile));
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent_and_order_independent() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, index) = index(Arc::clone(&store));
        let (a, b) = (UserId::from("u1"), UserId::from("u2"));

        let first = index.find_or_create(&a, &b).await.unwrap();
        let second = index.find_or_create(&a, &b).await.unwrap();
        let swapped = index.find_or_create(&b, &a).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, swapped);

        let all = store
            .query(&Query::collection(docs::CONVERSATIONS))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let conv = docs::conversation_from_doc(&all[0]).unwrap();
        assert_eq!(conv.participants.len(), 2);
        assert!(conv.participants.contains(&a));
        assert!(conv.participants.contains(&b));
    }

    #[tokio::test]
    async fn find_or_create_persists_a_conversation_key() {
        let store = Arc::new(MemoryStore::new());
        let (dir, keys) = temp_keys();
        let index = ConversationIndex::new(Arc::clone(&store) as _, Arc::clone(&keys));
        let _ = dir;

        let id = index
            .find_or_create(&UserId::from("u1"), &UserId::from("u2"))
            .await
            .unwrap();
        assert!(keys.get(&id).unwrap().is_some());

        // The second call reuses the conversation and the key.
        let key = keys.get(&id).unwrap();
        index
            .find_or_create(&UserId::from("u2"), &UserId::from("u1"))
            .await
            .unwrap();
        assert_eq!(keys.get(&id).unwrap(), key);
    }

    #[tokio::test]
    async fn find_or_create_ignores_group_conversations() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, index) = index(Arc::clone(&store));

        // A three-party record containing both users must not match.
        let mut fields = docs::conversation_fields(&UserId::from("u1"), &UserId::from("u2"));
        fields.insert("participants".to_string(), json!(["u1", "u2", "u3"]));
        store.create(docs::CONVERSATIONS, fields).await.unwrap();

        let id = index
            .find_or_create(&UserId::from("u1"), &UserId::from("u2"))
            .await
            .unwrap();

        let doc = store
            .get(docs::CONVERSATIONS, id.as_str())
            .await
            .unwrap()
            .unwrap();
        let conv = docs::conversation_from_doc(&doc).unwrap();
        assert_eq!(conv.participants.len(), 2);
    }

    async fn seed_three_conversations(store: &Arc<MemoryStore>, index: &ConversationIndex) {
        // Creation order u2, u3, u4; bump activity so u3 is most recent.
        let a = UserId::from("me");
        let c2 = index.find_or_create(&a, &UserId::from("u2")).await.unwrap();
        let c3 = index.find_or_create(&a, &UserId::from("u3")).await.unwrap();
        let _ = c2;
        store
            .update(
                docs::CONVERSATIONS,
                c3.as_str(),
                fields_with_server_stamp("last_message_at"),
            )
            .await
            .unwrap();
        index.find_or_create(&a, &UserId::from("u4")).await.unwrap();
        store
            .update(
                docs::CONVERSATIONS,
                c3.as_str(),
                fields_with_server_stamp("last_message_at"),
            )
            .await
            .unwrap();
    }

    fn fields_with_server_stamp(field: &str) -> crate::store::Fields {
        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), json!(SERVER_TIMESTAMP));
        fields
    }

    fn peers_in_order(conversations: &[Conversation]) -> Vec<String> {
        conversations
            .iter()
            .map(|c| c.peer_of(&UserId::from("me")).unwrap().as_str().to_string())
            .collect()
    }

    #[tokio::test]
    async fn list_orders_by_last_activity_descending() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, index) = index(Arc::clone(&store));
        seed_three_conversations(&store, &index).await;

        let conversations = index.list(&UserId::from("me")).await.unwrap();
        assert_eq!(peers_in_order(&conversations), vec!["u3", "u4", "u2"]);
    }

    #[tokio::test]
    async fn list_fallback_matches_indexed_result() {
        let indexed_store = Arc::new(MemoryStore::new());
        let (_d1, indexed_index) = index(Arc::clone(&indexed_store));
        seed_three_conversations(&indexed_store, &indexed_index).await;

        let plain_store = Arc::new(MemoryStore::without_composite_index());
        let (_d2, plain_index) = index(Arc::clone(&plain_store));
        seed_three_conversations(&plain_store, &plain_index).await;

        let via_index = indexed_index.list(&UserId::from("me")).await.unwrap();
        let via_fallback = plain_index.list(&UserId::from("me")).await.unwrap();

        assert_eq!(peers_in_order(&via_index), peers_in_order(&via_fallback));
        assert_eq!(peers_in_order(&via_fallback), vec!["u3", "u4", "u2"]);
    }

    #[tokio::test]
    async fn list_resolves_participant_profiles() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, index) = index(Arc::clone(&store));

        seed_profile(&store, "me", "Me");
        seed_profile(&store, "u2", "Other");
        index
            .find_or_create(&UserId::from("me"), &UserId::from("u2"))
            .await
            .unwrap();

        let conversations = index.list(&UserId::from("me")).await.unwrap();
        assert_eq!(conversations.len(), 1);
        let names: Vec<_> = conversations[0]
            .participant_profiles
            .iter()
            .map(|p| p.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["Me", "Other"]);
    }

    #[tokio::test]
    async fn subscribe_pushes_snapshots_on_change() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, index) = index(Arc::clone(&store));
        let index = Arc::new(index);

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let sub = index
            .subscribe(&UserId::from("me"), move |conversations| {
                seen_cb.lock().unwrap().push(conversations.len());
            })
            .await
            .unwrap();

        index
            .find_or_create(&UserId::from("me"), &UserId::from("u2"))
            .await
            .unwrap();

        wait_until(|| seen.lock().unwrap().last() == Some(&1)).await;
        assert_eq!(seen.lock().unwrap().first(), Some(&0));

        sub.cancel();
        sub.cancel(); // idempotent
    }

    #[tokio::test]
    async fn subscribe_falls_back_when_index_is_missing() {
        let store = Arc::new(MemoryStore::without_composite_index());
        let (_dir, index) = index(Arc::clone(&store));
        let index = Arc::new(index);
        seed_three_conversations(&store, &index).await;

        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        index
            .subscribe(&UserId::from("me"), move |conversations| {
                seen_cb.lock().unwrap().push(peers_in_order(&conversations));
            })
            .await
            .unwrap();

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(
            seen.lock().unwrap()[0],
            vec!["u3".to_string(), "u4".to_string(), "u2".to_string()]
        );
    }

    async fn wait_until(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }
}
