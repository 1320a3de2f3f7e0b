//! v001 -- Initial schema creation.
//!
//! Creates the `conversation_keys` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_keys (
    conversation_id TEXT PRIMARY KEY NOT NULL,  -- store-assigned id
    key_hex         TEXT NOT NULL,              -- hex-encoded 32-byte symmetric key
    created_at      TEXT NOT NULL               -- ISO-8601 / RFC-3339
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
