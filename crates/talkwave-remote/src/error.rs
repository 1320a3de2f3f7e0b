use thiserror::Error;

use talkwave_shared::CryptoError;
use talkwave_store::KeyStoreError;

/// Errors produced by the remote-store layer.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The store could not be reached or refused the operation.  Surfaced
    /// to the caller; never retried automatically.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The query needs a composite index the store does not have.  Callers
    /// in this crate recover silently by falling back to an unindexed
    /// query; this variant never reaches the UI layer.
    #[error("Query requires a composite index")]
    IndexMissing,

    /// An update targeted a document that does not exist.
    #[error("No document {id} in {collection}")]
    NotFound { collection: String, id: String },

    /// A remote document is missing a required field.
    #[error("Missing required field `{field}` in a {collection} document")]
    MissingField {
        collection: &'static str,
        field: &'static str,
    },

    /// A remote document field has an unexpected shape.
    #[error("Malformed field `{field}` in a {collection} document")]
    MalformedField {
        collection: &'static str,
        field: &'static str,
    },

    /// Encryption failed before send; the message is not sent.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The local key store failed.
    #[error("Key store error: {0}")]
    Keys(#[from] KeyStoreError),

    /// The attachment exceeds the allowed size.
    #[error("Attachment of {size} bytes exceeds the {limit} byte limit")]
    AttachmentTooLarge { size: usize, limit: usize },

    /// The object store rejected an upload.
    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RemoteError>;
