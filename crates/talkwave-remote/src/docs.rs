//! Document schemas and mapping between raw store documents and domain
//! records.
//!
//! Mapping fails loudly (`MissingField` / `MalformedField`) on required
//! fields instead of silently defaulting.  The deliberate exceptions,
//! preserved from the source system's lenient reads, are documented per
//! field: timestamps default to the mapping time, `read_by` and
//! `unread_count` default to empty, `is_online` defaults to false.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use talkwave_shared::{
    Attachment, Conversation, ConversationId, LastMessage, Message, MessageId, MessageKind,
    UserId, UserProfile,
};

use crate::error::{RemoteError, Result};
use crate::store::{Document, Fields, SERVER_TIMESTAMP};

/// Top-level conversation collection.
pub const CONVERSATIONS: &str = "conversations";

/// Identity records, keyed by user id.
pub const USERS: &str = "users";

/// Per-conversation message subcollection path.
pub fn messages_collection(conversation_id: &ConversationId) -> String {
    format!("{CONVERSATIONS}/{conversation_id}/messages")
}

// ---------------------------------------------------------------------------
// Field extraction helpers
// ---------------------------------------------------------------------------

fn required_str<'a>(
    fields: &'a Fields,
    collection: &'static str,
    field: &'static str,
) -> Result<&'a str> {
    match fields.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Null) | None => Err(RemoteError::MissingField { collection, field }),
        Some(_) => Err(RemoteError::MalformedField { collection, field }),
    }
}

fn optional_str(
    fields: &Fields,
    collection: &'static str,
    field: &'static str,
) -> Result<Option<String>> {
    match fields.get(field) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(RemoteError::MalformedField { collection, field }),
    }
}

/// Timestamp with the source's "default to now" read: absent, null, or
/// unparseable values become the mapping time.
fn timestamp_or_now(fields: &Fields, field: &str) -> DateTime<Utc> {
    fields
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn optional_timestamp(fields: &Fields, field: &str) -> Option<DateTime<Utc>> {
    fields
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn string_array(
    fields: &Fields,
    collection: &'static str,
    field: &'static str,
) -> Result<Vec<String>> {
    let arr = match fields.get(field) {
        Some(Value::Array(arr)) => arr,
        Some(Value::Null) | None => return Err(RemoteError::MissingField { collection, field }),
        Some(_) => return Err(RemoteError::MalformedField { collection, field }),
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or(RemoteError::MalformedField { collection, field })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Fields for a freshly created two-party conversation.
pub fn conversation_fields(a: &UserId, b: &UserId) -> Fields {
    let mut unread = Map::new();
    unread.insert(a.as_str().to_string(), json!(0));
    unread.insert(b.as_str().to_string(), json!(0));

    let mut fields = Map::new();
    fields.insert(
        "participants".to_string(),
        json!([a.as_str(), b.as_str()]),
    );
    fields.insert("created_at".to_string(), json!(SERVER_TIMESTAMP));
    fields.insert("last_message_at".to_string(), json!(SERVER_TIMESTAMP));
    fields.insert("last_message".to_string(), Value::Null);
    fields.insert("unread_count".to_string(), Value::Object(unread));
    fields
}

/// Map a raw conversation document.  `participant_profiles` is left empty;
/// resolution is the index's concern.
pub fn conversation_from_doc(doc: &Document) -> Result<Conversation> {
    let fields = &doc.fields;

    let participants = string_array(fields, CONVERSATIONS, "participants")?
        .into_iter()
        .map(UserId)
        .collect();

    let last_message = match fields.get("last_message") {
        Some(Value::Object(map)) => Some(LastMessage {
            sender_id: UserId(required_str(map, CONVERSATIONS, "sender_id")?.to_string()),
            preview: required_str(map, CONVERSATIONS, "preview")?.to_string(),
            sent_at: timestamp_or_now(map, "sent_at"),
        }),
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(RemoteError::MalformedField {
                collection: CONVERSATIONS,
                field: "last_message",
            })
        }
    };

    let unread_count = match fields.get("unread_count") {
        Some(Value::Object(map)) => {
            let mut counts = HashMap::new();
            for (user, value) in map {
                let count = value.as_u64().ok_or(RemoteError::MalformedField {
                    collection: CONVERSATIONS,
                    field: "unread_count",
                })?;
                counts.insert(UserId(user.clone()), count as u32);
            }
            counts
        }
        // Defaults to empty, as the source does.
        Some(Value::Null) | None => HashMap::new(),
        Some(_) => {
            return Err(RemoteError::MalformedField {
                collection: CONVERSATIONS,
                field: "unread_count",
            })
        }
    };

    Ok(Conversation {
        id: ConversationId(doc.id.clone()),
        participants,
        participant_profiles: Vec::new(),
        last_message,
        last_message_at: timestamp_or_now(fields, "last_message_at"),
        unread_count,
        created_at: timestamp_or_now(fields, "created_at"),
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Map a raw identity document.  The document id is the user id.
pub fn profile_from_doc(doc: &Document) -> Result<UserProfile> {
    let fields = &doc.fields;
    Ok(UserProfile {
        id: UserId(doc.id.clone()),
        display_name: required_str(fields, USERS, "display_name")?.to_string(),
        avatar_url: optional_str(fields, USERS, "avatar_url")?,
        // Defaults to offline, as the source does.
        is_online: fields
            .get("is_online")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        last_seen: timestamp_or_now(fields, "last_seen"),
    })
}

/// Fields for an identity record, for tests and seeding tools.
pub fn profile_fields(profile: &UserProfile) -> Fields {
    let mut fields = Map::new();
    fields.insert("display_name".to_string(), json!(profile.display_name));
    fields.insert(
        "avatar_url".to_string(),
        profile
            .avatar_url
            .as_ref()
            .map(|u| json!(u))
            .unwrap_or(Value::Null),
    );
    fields.insert("is_online".to_string(), json!(profile.is_online));
    fields.insert(
        "last_seen".to_string(),
        json!(profile.last_seen.to_rfc3339()),
    );
    fields
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

const MESSAGES: &str = "messages";

/// Map a raw message document.  Content is returned exactly as stored;
/// decryption is the message log's concern.
pub fn message_from_doc(doc: &Document) -> Result<Message> {
    let fields = &doc.fields;

    let kind_str = required_str(fields, MESSAGES, "kind")?;
    let kind = MessageKind::parse(kind_str).ok_or(RemoteError::MalformedField {
        collection: MESSAGES,
        field: "kind",
    })?;

    let attachment = match fields.get("attachment") {
        Some(Value::Object(map)) => Some(Attachment {
            url: required_str(map, MESSAGES, "url")?.to_string(),
            file_name: required_str(map, MESSAGES, "file_name")?.to_string(),
            file_size: map
                .get("file_size")
                .and_then(Value::as_u64)
                .ok_or(RemoteError::MissingField {
                    collection: MESSAGES,
                    field: "file_size",
                })?,
            mime_type: required_str(map, MESSAGES, "mime_type")?.to_string(),
        }),
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(RemoteError::MalformedField {
                collection: MESSAGES,
                field: "attachment",
            })
        }
    };

    let read_by = match fields.get("read_by") {
        // Defaults to empty, as the source does.
        Some(Value::Null) | None => Vec::new(),
        Some(_) => string_array(fields, MESSAGES, "read_by")?
            .into_iter()
            .map(UserId)
            .collect(),
    };

    Ok(Message {
        id: MessageId(doc.id.clone()),
        sender_id: UserId(required_str(fields, MESSAGES, "sender_id")?.to_string()),
        sender_name: required_str(fields, MESSAGES, "sender_name")?.to_string(),
        sender_avatar_url: optional_str(fields, MESSAGES, "sender_avatar_url")?,
        content: required_str(fields, MESSAGES, "content")?.to_string(),
        kind,
        attachment,
        read_by,
        is_encrypted: fields
            .get("is_encrypted")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        created_at: timestamp_or_now(fields, "created_at"),
        updated_at: optional_timestamp(fields, "updated_at"),
    })
}
