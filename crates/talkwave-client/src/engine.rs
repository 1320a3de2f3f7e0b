//! The conversation sync engine.
//!
//! Owns the [`ChatState`] mirror and every live subscription, and is the
//! only code that mutates either.  Remote failures never escape as panics:
//! they are logged, recorded on the mirror, and (for sends) returned with
//! the draft so the UI can restore it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, error};

use talkwave_remote::{
    ConversationIndex, DocumentStore, MessageDraft, MessageLog, ObjectStore, Subscription,
};
use talkwave_shared::{Conversation, ConversationId, Message, MessageId, UserId};
use talkwave_store::KeyStore;

use crate::auth::AuthContext;
use crate::error::{EngineError, SendError};
use crate::events::{EngineEvent, EngineEvents};
use crate::state::ChatState;

pub struct SyncEngine {
    index: ConversationIndex,
    log: Arc<MessageLog>,
    auth: AuthContext,
    state: Arc<Mutex<ChatState>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    conversation_sub: Mutex<Option<Subscription>>,
    message_subs: Mutex<HashMap<ConversationId, Subscription>>,
    /// Mirror size at the last push per opened conversation, the baseline
    /// for growth detection.  Absent until the first push after open.
    seen_counts: Arc<Mutex<HashMap<ConversationId, usize>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncEngine {
    /// Build an engine and the receiving half of its event stream.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn ObjectStore>,
        keys: Arc<KeyStore>,
        auth: AuthContext,
    ) -> (Self, EngineEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            index: ConversationIndex::new(Arc::clone(&store), Arc::clone(&keys)),
            log: Arc::new(MessageLog::new(store, blobs, keys)),
            auth,
            state: Arc::new(Mutex::new(ChatState::default())),
            events,
            conversation_sub: Mutex::new(None),
            message_subs: Mutex::new(HashMap::new()),
            seen_counts: Arc::new(Mutex::new(HashMap::new())),
        };
        (engine, events_rx)
    }

    /// Snapshot of the current mirror.
    pub fn state(&self) -> ChatState {
        lock(&self.state).clone()
    }

    /// The conversation between the signed-in user and `peer`, created if
    /// it does not exist yet.
    pub async fn start_conversation(&self, peer: &UserId) -> Result<ConversationId, EngineError> {
        let me = self.auth.current().ok_or(EngineError::NotAuthenticated)?;
        Ok(self.index.find_or_create(&me.id, peer).await?)
    }

    /// One-shot conversation load.  On failure the prior mirror is kept and
    /// the error recorded; there is no automatic retry.
    pub async fn load_conversations(&self, user: &UserId) {
        {
            let mut state = lock(&self.state);
            state.loading = true;
            state.error = None;
        }

        let result = self.index.list(user).await;

        let mut state = lock(&self.state);
        match result {
            Ok(conversations) => state.conversations = conversations,
            Err(e) => {
                error!(error = %e, "conversation load failed");
                state.error = Some(e.to_string());
            }
        }
        state.loading = false;
    }

    /// Start the live conversation feed, replacing the mirror wholesale on
    /// every push.  A previously established feed is cancelled first.
    pub async fn observe_conversations(&self, user: &UserId) -> Result<(), EngineError> {
        let state = Arc::clone(&self.state);
        let sub = self
            .index
            .subscribe(user, move |conversations| {
                lock(&state).conversations = conversations;
            })
            .await?;

        if let Some(old) = lock(&self.conversation_sub).replace(sub) {
            old.cancel();
        }
        Ok(())
    }

    /// Point the mirror at a conversation.  Pure state update.
    pub fn select_conversation(&self, conversation: &Conversation) {
        lock(&self.state).active_conversation = Some(conversation.id.clone());
    }

    /// Start the live message feed for a conversation.
    ///
    /// Each push replaces the per-conversation history wholesale.  When the
    /// history grows and the newest entry was sent by someone else, exactly
    /// one [`EngineEvent::MessageReceived`] is emitted; the opening snapshot
    /// and read-receipt-only pushes never fire.  Reopening resets the
    /// growth baseline.
    pub async fn open_messages(&self, conversation_id: &ConversationId) -> Result<(), EngineError> {
        // An existing feed must stop before the baseline resets, or its next
        // push would seed a stale baseline and make the new feed's opening
        // snapshot look like growth.
        if let Some(old) = lock(&self.message_subs).remove(conversation_id) {
            old.cancel();
        }
        lock(&self.seen_counts).remove(conversation_id);

        let state = Arc::clone(&self.state);
        let seen = Arc::clone(&self.seen_counts);
        let auth = self.auth.clone();
        let events = self.events.clone();
        let id = conversation_id.clone();

        let sub = self
            .log
            .subscribe(conversation_id, move |messages| {
                let previous = lock(&seen).insert(id.clone(), messages.len());
                let grew = previous.is_some_and(|p| messages.len() > p);
                let newest = if grew { messages.last().cloned() } else { None };

                // Mirror first, so an event consumer sees the new history.
                lock(&state).messages.insert(id.clone(), messages);

                if let Some(newest) = newest {
                    let mine = auth
                        .current()
                        .is_some_and(|me| me.id == newest.sender_id);
                    if !mine {
                        // Receiver may be gone; events are best-effort.
                        let _ = events.send(EngineEvent::MessageReceived {
                            conversation_id: id.clone(),
                            message_id: newest.id,
                            sender_id: newest.sender_id,
                            timestamp: newest.created_at,
                        });
                    }
                }
            })
            .await?;

        if let Some(old) = lock(&self.message_subs).insert(conversation_id.clone(), sub) {
            old.cancel();
        }
        Ok(())
    }

    /// Stop the live message feed for a conversation.  Idempotent; the
    /// mirrored history stays readable after close.
    pub fn close_messages(&self, conversation_id: &ConversationId) {
        if let Some(sub) = lock(&self.message_subs).remove(conversation_id) {
            sub.cancel();
        }
        lock(&self.seen_counts).remove(conversation_id);
    }

    /// Send a text message.  A draft that is empty after trimming is a
    /// silent no-op.  On failure the draft comes back in the error so the
    /// UI can restore the input field.
    pub async fn send_text(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Option<MessageId>, SendError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            debug!("empty draft, nothing to send");
            return Ok(None);
        }

        let sender = match self.auth.current() {
            Some(sender) => sender,
            None => {
                return Err(self.record_send_failure(
                    EngineError::NotAuthenticated.to_string(),
                    Some(content.to_string()),
                ))
            }
        };

        match self
            .log
            .append(conversation_id, &MessageDraft::text(&sender, trimmed))
            .await
        {
            Ok(message_id) => {
                let _ = self.events.send(EngineEvent::MessageSent {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                });
                Ok(Some(message_id))
            }
            Err(e) => {
                error!(conversation = %conversation_id, error = %e, "send failed");
                Err(self.record_send_failure(e.to_string(), Some(content.to_string())))
            }
        }
    }

    /// Upload a file and send the message referencing it.  Same failure
    /// contract as [`send_text`](Self::send_text), without input
    /// restoration.
    pub async fn send_file(
        &self,
        conversation_id: &ConversationId,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<MessageId, SendError> {
        let sender = match self.auth.current() {
            Some(sender) => sender,
            None => {
                return Err(
                    self.record_send_failure(EngineError::NotAuthenticated.to_string(), None)
                )
            }
        };

        match self
            .log
            .append_file(conversation_id, &sender, file_name, mime_type, bytes)
            .await
        {
            Ok(message_id) => {
                let _ = self.events.send(EngineEvent::MessageSent {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                });
                Ok(message_id)
            }
            Err(e) => {
                error!(conversation = %conversation_id, error = %e, "file send failed");
                Err(self.record_send_failure(e.to_string(), None))
            }
        }
    }

    /// Case-insensitive substring search over a conversation's mirrored
    /// history.  Encrypted content cannot be queried remotely, so search is
    /// local by construction; an unopened conversation yields nothing.
    pub fn search_messages(&self, conversation_id: &ConversationId, query: &str) -> Vec<Message> {
        let needle = query.to_lowercase();
        lock(&self.state)
            .messages
            .get(conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark every message in a conversation read by the signed-in user and
    /// reset their unread counter.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), EngineError> {
        let me = self.auth.current().ok_or(EngineError::NotAuthenticated)?;
        self.log
            .mark_conversation_read(conversation_id, &me.id)
            .await?;
        Ok(())
    }

    /// Cancel every live subscription.  The mirror stays readable; call at
    /// sign-out or teardown.
    pub fn shutdown(&self) {
        if let Some(sub) = lock(&self.conversation_sub).take() {
            sub.cancel();
        }
        for (_, sub) in lock(&self.message_subs).drain() {
            sub.cancel();
        }
        lock(&self.seen_counts).clear();
        debug!("engine shut down");
    }

    fn record_send_failure(&self, reason: String, restored_input: Option<String>) -> SendError {
        lock(&self.state).error = Some(reason.clone());
        SendError {
            reason,
            restored_input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use talkwave_remote::{MemoryBlobStore, MemoryStore};
    use talkwave_shared::UserProfile;

    fn profile(id: &str, name: &str) -> UserProfile {
        UserProfile {
            id: UserId::from(id),
            display_name: name.to_string(),
            avatar_url: None,
            is_online: true,
            last_seen: Utc::now(),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        keys: Arc<KeyStore>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let keys = Arc::new(KeyStore::open_at(&dir.path().join("keys.db")).unwrap());
            Self {
                _dir: dir,
                store: Arc::new(MemoryStore::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                keys,
            }
        }

        /// An engine signed in as the given user, sharing the harness
        /// stores (two engines model two devices with a shared key store).
        fn engine_for(&self, id: &str, name: &str) -> (SyncEngine, EngineEvents) {
            SyncEngine::new(
                Arc::clone(&self.store) as _,
                Arc::clone(&self.blobs) as _,
                Arc::clone(&self.keys),
                AuthContext::signed_in(profile(id, name)),
            )
        }
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

    async fn next_event(rx: &mut EngineEvents) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within 2s")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn end_to_end_two_user_exchange() {
        let h = Harness::new();
        let (alice, mut alice_events) = h.engine_for("alice", "Alice");
        let (bob, mut bob_events) = h.engine_for("bob", "Bob");

        alice
            .observe_conversations(&UserId::from("alice"))
            .await
            .unwrap();
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();
        wait_until(|| alice.state().conversations.len() == 1).await;

        let conversation = alice.state().conversations[0].clone();
        alice.select_conversation(&conversation);
        assert_eq!(alice.state().active_conversation, Some(cid.clone()));

        alice.open_messages(&cid).await.unwrap();
        let sent = alice.send_text(&cid, "  hello bob  ").await.unwrap().unwrap();
        assert_eq!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageSent {
                conversation_id: cid.clone(),
                message_id: sent,
            }
        );
        wait_until(|| {
            alice
                .state()
                .messages
                .get(&cid)
                .is_some_and(|m| m.len() == 1 && m[0].content == "hello bob")
        })
        .await;

        bob.load_conversations(&UserId::from("bob")).await;
        let bob_view = bob.state();
        assert_eq!(bob_view.conversations.len(), 1);
        let conv = &bob_view.conversations[0];
        assert_eq!(conv.unread_count[&UserId::from("bob")], 1);
        assert_eq!(conv.last_message.as_ref().unwrap().preview, "hello bob");

        // The opening snapshot never notifies, even with history present.
        bob.open_messages(&cid).await.unwrap();
        wait_until(|| bob.state().messages.get(&cid).is_some_and(|m| m.len() == 1)).await;
        assert!(bob_events.try_recv().is_err());

        alice.send_text(&cid, "second").await.unwrap();
        match next_event(&mut bob_events).await {
            EngineEvent::MessageReceived {
                conversation_id,
                sender_id,
                ..
            } => {
                assert_eq!(conversation_id, cid);
                assert_eq!(sender_id, UserId::from("alice"));
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }
        assert_eq!(bob.state().messages[&cid][1].content, "second");

        bob.mark_conversation_read(&cid).await.unwrap();
        bob.load_conversations(&UserId::from("bob")).await;
        assert_eq!(
            bob.state().conversations[0].unread_count[&UserId::from("bob")],
            0
        );

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn own_messages_never_fire_message_received() {
        let h = Harness::new();
        let (alice, mut alice_events) = h.engine_for("alice", "Alice");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.open_messages(&cid).await.unwrap();
        alice.send_text(&cid, "to myself, sort of").await.unwrap();
        wait_until(|| alice.state().messages.get(&cid).is_some_and(|m| m.len() == 1)).await;

        assert!(matches!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageSent { .. }
        ));
        assert!(alice_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn receipt_only_pushes_do_not_notify() {
        let h = Harness::new();
        let (alice, mut alice_events) = h.engine_for("alice", "Alice");
        let (bob, _bob_events) = h.engine_for("bob", "Bob");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.open_messages(&cid).await.unwrap();
        bob.send_text(&cid, "ping").await.unwrap();
        wait_until(|| alice.state().messages.get(&cid).is_some_and(|m| m.len() == 1)).await;
        assert!(matches!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageReceived { .. }
        ));

        // Growing read_by changes the documents but not the count.
        alice.mark_conversation_read(&cid).await.unwrap();
        wait_until(|| {
            alice
                .state()
                .messages
                .get(&cid)
                .is_some_and(|m| m[0].read_by.contains(&UserId::from("alice")))
        })
        .await;
        assert!(alice_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn reopening_resets_the_growth_baseline() {
        let h = Harness::new();
        let (alice, mut alice_events) = h.engine_for("alice", "Alice");
        let (bob, _bob_events) = h.engine_for("bob", "Bob");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.open_messages(&cid).await.unwrap();
        bob.send_text(&cid, "one").await.unwrap();
        assert!(matches!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageReceived { .. }
        ));

        alice.close_messages(&cid);
        alice.close_messages(&cid); // idempotent

        // The reopening snapshot already contains "one": no notification.
        alice.open_messages(&cid).await.unwrap();
        wait_until(|| alice.state().messages.get(&cid).is_some_and(|m| m.len() == 1)).await;
        assert!(alice_events.try_recv().is_err());

        bob.send_text(&cid, "two").await.unwrap();
        assert!(matches!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageReceived { .. }
        ));
    }

    #[tokio::test]
    async fn reopening_without_close_does_not_notify_for_existing_history() {
        let h = Harness::new();
        let (alice, mut alice_events) = h.engine_for("alice", "Alice");
        let (bob, _bob_events) = h.engine_for("bob", "Bob");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.open_messages(&cid).await.unwrap();
        bob.send_text(&cid, "one").await.unwrap();
        assert!(matches!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageReceived { .. }
        ));

        // Reopen on top of the live feed.  The old feed must be gone before
        // the baseline resets, so the fresh opening snapshot (which already
        // holds "one") never counts as growth.
        alice.open_messages(&cid).await.unwrap();
        wait_until(|| alice.state().messages.get(&cid).is_some_and(|m| m.len() == 1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(alice_events.try_recv().is_err());

        bob.send_text(&cid, "two").await.unwrap();
        assert!(matches!(
            next_event(&mut alice_events).await,
            EngineEvent::MessageReceived { .. }
        ));
    }

    #[tokio::test]
    async fn failed_load_keeps_the_prior_mirror() {
        let h = Harness::new();
        let (alice, _events) = h.engine_for("alice", "Alice");
        alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.load_conversations(&UserId::from("alice")).await;
        assert_eq!(alice.state().conversations.len(), 1);
        assert!(alice.state().error.is_none());

        h.store.set_offline(true);
        alice.load_conversations(&UserId::from("alice")).await;

        let state = alice.state();
        assert_eq!(state.conversations.len(), 1);
        assert!(state.error.is_some());
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn failed_send_restores_the_draft() {
        let h = Harness::new();
        let (alice, mut events) = h.engine_for("alice", "Alice");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        h.store.set_offline(true);
        let err = alice.send_text(&cid, "precious draft").await.unwrap_err();
        assert_eq!(err.restored_input.as_deref(), Some("precious draft"));
        assert!(alice.state().error.is_some());
        assert!(events.try_recv().is_err());

        h.store.set_offline(false);
        assert!(alice.send_text(&cid, "precious draft").await.is_ok());
    }

    #[tokio::test]
    async fn empty_draft_is_a_silent_no_op() {
        let h = Harness::new();
        let (alice, mut events) = h.engine_for("alice", "Alice");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        assert!(alice.send_text(&cid, "   \n\t ").await.unwrap().is_none());
        assert!(events.try_recv().is_err());

        alice.open_messages(&cid).await.unwrap();
        wait_until(|| alice.state().messages.contains_key(&cid)).await;
        assert!(alice.state().messages[&cid].is_empty());
    }

    #[tokio::test]
    async fn file_send_flows_through_the_mirror() {
        let h = Harness::new();
        let (alice, mut events) = h.engine_for("alice", "Alice");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.open_messages(&cid).await.unwrap();
        alice
            .send_file(&cid, "pic.jpg", "image/jpeg", b"jpegbytes")
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::MessageSent { .. }
        ));

        wait_until(|| alice.state().messages.get(&cid).is_some_and(|m| m.len() == 1)).await;
        let state = alice.state();
        let message = &state.messages[&cid][0];
        assert_eq!(message.content, "pic.jpg");
        assert!(message.attachment.is_some());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_over_the_mirror() {
        let h = Harness::new();
        let (alice, _events) = h.engine_for("alice", "Alice");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        alice.open_messages(&cid).await.unwrap();
        alice.send_text(&cid, "Hello World").await.unwrap();
        alice.send_text(&cid, "unrelated").await.unwrap();
        wait_until(|| alice.state().messages.get(&cid).is_some_and(|m| m.len() == 2)).await;

        assert_eq!(alice.search_messages(&cid, "hello").len(), 1);
        assert_eq!(alice.search_messages(&cid, "WORLD").len(), 1);
        assert_eq!(alice.search_messages(&cid, "absent").len(), 0);
        assert!(alice
            .search_messages(&ConversationId::from("unopened"), "x")
            .is_empty());
    }

    #[tokio::test]
    async fn signed_out_engine_refuses_to_operate() {
        let h = Harness::new();
        let (alice, _events) = h.engine_for("alice", "Alice");
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();

        let (stranger, _ev) = SyncEngine::new(
            Arc::clone(&h.store) as _,
            Arc::clone(&h.blobs) as _,
            Arc::clone(&h.keys),
            AuthContext::new(),
        );

        assert!(matches!(
            stranger.start_conversation(&UserId::from("bob")).await,
            Err(EngineError::NotAuthenticated)
        ));
        let err = stranger.send_text(&cid, "hi").await.unwrap_err();
        assert_eq!(err.restored_input.as_deref(), Some("hi"));
        assert!(matches!(
            stranger.mark_conversation_read(&cid).await,
            Err(EngineError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_every_feed() {
        let h = Harness::new();
        let (alice, _events) = h.engine_for("alice", "Alice");
        let (bob, _bob_events) = h.engine_for("bob", "Bob");

        alice
            .observe_conversations(&UserId::from("alice"))
            .await
            .unwrap();
        let cid = alice.start_conversation(&UserId::from("bob")).await.unwrap();
        alice.open_messages(&cid).await.unwrap();
        wait_until(|| alice.state().conversations.len() == 1).await;

        alice.shutdown();
        alice.shutdown(); // idempotent

        bob.send_text(&cid, "after the lights went out").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alice
            .state()
            .messages
            .get(&cid)
            .map_or(true, |m| m.is_empty()));
    }
}
