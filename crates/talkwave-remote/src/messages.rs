//! Per-conversation message log: append, history, live feed, read receipts,
//! and attachment uploads.
//!
//! Message bodies are encrypted before they leave the device whenever a
//! conversation key is held locally, and decrypted fail-closed on the way
//! back in.  The denormalized summary on the parent conversation document
//! (preview, activity time, unread counts) is updated best-effort after the
//! append: its failure is logged, never surfaced, because the message itself
//! is already durable.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use talkwave_shared::constants::{MAX_ATTACHMENT_SIZE, PREVIEW_MAX_CHARS};
use talkwave_shared::crypto::{decrypt_text, encrypt_text, SymmetricKey};
use talkwave_shared::{ConversationId, Message, MessageId, MessageKind, UserId, UserProfile};
use talkwave_store::KeyStore;

use crate::docs;
use crate::error::{RemoteError, Result};
use crate::store::{
    Document, DocumentStore, Fields, ObjectStore, Query, Subscription, SERVER_TIMESTAMP,
};

/// An outgoing text message, before encryption and send.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Snapshot of the sender's identity, denormalized onto the message.
    pub sender: UserProfile,
    pub content: String,
}

impl MessageDraft {
    pub fn text(sender: &UserProfile, content: impl Into<String>) -> Self {
        Self {
            sender: sender.clone(),
            content: content.into(),
        }
    }
}

/// Append-only log of one conversation's messages.
pub struct MessageLog {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn ObjectStore>,
    keys: Arc<KeyStore>,
}

impl MessageLog {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn ObjectStore>,
        keys: Arc<KeyStore>,
    ) -> Self {
        Self { store, blobs, keys }
    }

    /// Append a text message.
    ///
    /// When a conversation key is held locally the body is encrypted and the
    /// message flagged `is_encrypted`; without one the body goes up in
    /// plaintext, unflagged, so readers never try to decrypt it.  The sender
    /// is pre-added to `read_by`.  Ordering comes from the store's clock,
    /// never the device's.
    pub async fn append(
        &self,
        conversation_id: &ConversationId,
        draft: &MessageDraft,
    ) -> Result<MessageId> {
        let (content, is_encrypted) = match self.keys.get(conversation_id)? {
            Some(key) => (encrypt_text(&key, &draft.content)?, true),
            None => (draft.content.clone(), false),
        };

        let mut fields = message_fields(&draft.sender, &content, MessageKind::Text, is_encrypted);
        fields.insert("attachment".to_string(), Value::Null);

        let id = self
            .store
            .create(&docs::messages_collection(conversation_id), fields)
            .await?;

        self.bump_conversation(conversation_id, &draft.sender.id, &preview_of(&draft.content))
            .await;

        Ok(MessageId(id))
    }

    /// Upload an attachment and append the message referencing it.
    ///
    /// The message kind is derived from the declared MIME type and the body
    /// carries the original file name, unencrypted.  Oversized payloads are
    /// rejected before any upload starts.
    pub async fn append_file(
        &self,
        conversation_id: &ConversationId,
        sender: &UserProfile,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<MessageId> {
        if bytes.len() > MAX_ATTACHMENT_SIZE {
            return Err(RemoteError::AttachmentTooLarge {
                size: bytes.len(),
                limit: MAX_ATTACHMENT_SIZE,
            });
        }

        let path = format!(
            "messages/{}/{}_{}",
            conversation_id,
            Utc::now().timestamp_millis(),
            file_name
        );
        let handle = self.blobs.upload(&path, bytes).await?;
        let url = self.blobs.public_url(&handle);

        let kind = MessageKind::from_mime(mime_type);
        let mut fields = message_fields(sender, file_name, kind, false);
        fields.insert(
            "attachment".to_string(),
            json!({
                "url": url,
                "file_name": file_name,
                "file_size": bytes.len() as u64,
                "mime_type": mime_type,
            }),
        );

        let id = self
            .store
            .create(&docs::messages_collection(conversation_id), fields)
            .await?;

        self.bump_conversation(conversation_id, &sender.id, &preview_of(file_name))
            .await;

        Ok(MessageId(id))
    }

    /// Full history in send order (oldest first), decrypted.
    pub async fn list(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let raw = self.store.query(&history_query(conversation_id)).await?;
        let key = self.keys.get(conversation_id)?;
        resolve_messages(&raw, key.as_ref())
    }

    /// Live feed of the history, pushing the full decrypted log on every
    /// change.  Snapshots that fail to map are dropped with a logged error,
    /// leaving the consumer on its previous state.
    pub async fn subscribe<F>(&self, conversation_id: &ConversationId, on_change: F) -> Result<Subscription>
    where
        F: Fn(Vec<Message>) + Send + Sync + 'static,
    {
        let (mut rx, sub) = self
            .store
            .subscribe(&history_query(conversation_id))
            .await?;

        let keys = Arc::clone(&self.keys);
        let conversation_id = conversation_id.clone();
        let handle = sub.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                if handle.is_cancelled() {
                    break;
                }
                let key = match keys.get(&conversation_id) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "key lookup failed, dropping message snapshot");
                        continue;
                    }
                };
                match resolve_messages(&raw, key.as_ref()) {
                    Ok(messages) => on_change(messages),
                    Err(e) => warn!(error = %e, "dropping unresolvable message snapshot"),
                }
            }
            debug!(conversation = %conversation_id, "message feed ended");
        });

        Ok(sub)
    }

    /// Record that `reader` has read one message.  Idempotent: a reader
    /// already present in `read_by` leaves the document untouched.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        reader: &UserId,
    ) -> Result<()> {
        let collection = docs::messages_collection(conversation_id);
        let doc = self
            .store
            .get(&collection, message_id.as_str())
            .await?
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.clone(),
                id: message_id.as_str().to_string(),
            })?;

        let message = docs::message_from_doc(&doc)?;
        if message.read_by.contains(reader) {
            return Ok(());
        }

        let mut read_by: Vec<Value> = message
            .read_by
            .iter()
            .map(|u| json!(u.as_str()))
            .collect();
        read_by.push(json!(reader.as_str()));

        let mut fields = Map::new();
        fields.insert("read_by".to_string(), Value::Array(read_by));
        self.store.update(&collection, message_id.as_str(), fields).await
    }

    /// Mark every message in the conversation read by `reader` and reset
    /// their unread counter on the parent document.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<()> {
        let raw = self.store.query(&history_query(conversation_id)).await?;
        for doc in &raw {
            let message = docs::message_from_doc(doc)?;
            if !message.read_by.contains(reader) {
                self.mark_read(conversation_id, &message.id, reader).await?;
            }
        }

        let parent = self
            .store
            .get(docs::CONVERSATIONS, conversation_id.as_str())
            .await?
            .ok_or_else(|| RemoteError::NotFound {
                collection: docs::CONVERSATIONS.to_string(),
                id: conversation_id.as_str().to_string(),
            })?;
        let conversation = docs::conversation_from_doc(&parent)?;

        let mut unread = Map::new();
        for (user, count) in &conversation.unread_count {
            let count = if user == reader { 0 } else { *count };
            unread.insert(user.as_str().to_string(), json!(count));
        }
        unread.insert(reader.as_str().to_string(), json!(0));

        let mut fields = Map::new();
        fields.insert("unread_count".to_string(), Value::Object(unread));
        self.store
            .update(docs::CONVERSATIONS, conversation_id.as_str(), fields)
            .await
    }

    /// Refresh the parent conversation's denormalized summary after an
    /// append.  Best-effort: the message is already durable, so a failure
    /// here only leaves the conversation list stale until the next append.
    async fn bump_conversation(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        preview: &str,
    ) {
        if let Err(e) = self.try_bump(conversation_id, sender, preview).await {
            warn!(conversation = %conversation_id, error = %e, "conversation summary update failed");
        }
    }

    async fn try_bump(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        preview: &str,
    ) -> Result<()> {
        let doc = self
            .store
            .get(docs::CONVERSATIONS, conversation_id.as_str())
            .await?
            .ok_or_else(|| RemoteError::NotFound {
                collection: docs::CONVERSATIONS.to_string(),
                id: conversation_id.as_str().to_string(),
            })?;
        let conversation = docs::conversation_from_doc(&doc)?;

        // Unread counters grow for everyone but the sender.  Read-modify-
        // write without a transaction, like the source system.
        let mut unread = Map::new();
        for participant in &conversation.participants {
            let current = conversation
                .unread_count
                .get(participant)
                .copied()
                .unwrap_or(0);
            let next = if participant == sender {
                current
            } else {
                current + 1
            };
            unread.insert(participant.as_str().to_string(), json!(next));
        }

        let mut fields = Map::new();
        fields.insert(
            "last_message".to_string(),
            json!({
                "sender_id": sender.as_str(),
                "preview": preview,
                "sent_at": SERVER_TIMESTAMP,
            }),
        );
        fields.insert("last_message_at".to_string(), json!(SERVER_TIMESTAMP));
        fields.insert("unread_count".to_string(), Value::Object(unread));

        self.store
            .update(docs::CONVERSATIONS, conversation_id.as_str(), fields)
            .await
    }
}

fn history_query(conversation_id: &ConversationId) -> Query {
    // No filter, so this never needs a composite index.
    Query::collection(docs::messages_collection(conversation_id)).order_by("created_at", false)
}

fn message_fields(
    sender: &UserProfile,
    content: &str,
    kind: MessageKind,
    is_encrypted: bool,
) -> Fields {
    let mut fields = Map::new();
    fields.insert("sender_id".to_string(), json!(sender.id.as_str()));
    fields.insert("sender_name".to_string(), json!(sender.display_name));
    fields.insert(
        "sender_avatar_url".to_string(),
        sender
            .avatar_url
            .as_ref()
            .map(|u| json!(u))
            .unwrap_or(Value::Null),
    );
    fields.insert("content".to_string(), json!(content));
    fields.insert("kind".to_string(), json!(kind.as_str()));
    fields.insert("read_by".to_string(), json!([sender.id.as_str()]));
    fields.insert("is_encrypted".to_string(), json!(is_encrypted));
    fields.insert("created_at".to_string(), json!(SERVER_TIMESTAMP));
    fields
}

/// Map raw documents and decrypt bodies.
///
/// Decryption fails closed into the placeholder.  A flagged body with no
/// local key is returned exactly as stored: there is nothing to decrypt
/// with, and the ciphertext is at least honest about it.
fn resolve_messages(raw: &[Document], key: Option<&SymmetricKey>) -> Result<Vec<Message>> {
    raw.iter()
        .map(|doc| {
            let mut message = docs::message_from_doc(doc)?;
            if message.is_encrypted {
                if let Some(key) = key {
                    message.content = decrypt_text(key, &message.content);
                }
            }
            Ok(message)
        })
        .collect()
}

/// Character-bounded plaintext preview for the conversation list.
fn preview_of(content: &str) -> String {
    let mut preview: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
    if content.chars().count() > PREVIEW_MAX_CHARS {
        preview.push('…');
    }
    preview
}
