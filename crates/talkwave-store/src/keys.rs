//! CRUD operations for conversation keys.

use std::collections::HashMap;

use rusqlite::params;

use talkwave_shared::crypto::{self, SymmetricKey};
use talkwave_shared::ConversationId;

use crate::database::KeyStore;
use crate::error::{KeyStoreError, Result};

impl KeyStore {
    /// Persist a key for a conversation, overwriting any existing entry.
    pub fn insert(&self, conversation_id: &ConversationId, key: &SymmetricKey) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversation_keys (conversation_id, key_hex, created_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(conversation_id) DO UPDATE SET key_hex = excluded.key_hex",
            params![conversation_id.as_str(), hex::encode(key)],
        )?;
        Ok(())
    }

    /// Look up the key for a conversation.
    ///
    /// `Ok(None)` means the conversation's messages are treated as
    /// plaintext: no encryption is applied on send and decryption is
    /// skipped on receive.
    pub fn get(&self, conversation_id: &ConversationId) -> Result<Option<SymmetricKey>> {
        let key_hex: Option<String> = self
            .conn()
            .query_row(
                "SELECT key_hex FROM conversation_keys WHERE conversation_id = ?1",
                params![conversation_id.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(KeyStoreError::Sqlite(other)),
            })?;

        match key_hex {
            Some(hex_str) => {
                let key = crypto::key_from_hex(&hex_str).map_err(|_| {
                    KeyStoreError::CorruptKey(conversation_id.as_str().to_string())
                })?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Load every stored key, keyed by conversation id.
    ///
    /// Rows with corrupt key material are skipped with a warning rather
    /// than failing the whole load.
    pub fn all(&self) -> Result<HashMap<ConversationId, SymmetricKey>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT conversation_id, key_hex FROM conversation_keys")?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let key_hex: String = row.get(1)?;
            Ok((id, key_hex))
        })?;

        let mut keys = HashMap::new();
        for row in rows {
            let (id, key_hex) = row?;
            match crypto::key_from_hex(&key_hex) {
                Ok(key) => {
                    keys.insert(ConversationId(id), key);
                }
                Err(_) => {
                    tracing::warn!(conversation = %id, "skipping corrupt key material");
                }
            }
        }
        Ok(keys)
    }
}
