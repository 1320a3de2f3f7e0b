//! # talkwave-remote
//!
//! Remote-store facing half of the TalkWave sync core.
//!
//! The hosted document store and object store are consumed through the
//! abstract [`DocumentStore`] / [`ObjectStore`] traits; [`MemoryStore`] is a
//! complete in-process implementation used by tests and local development.
//! On top of the traits sit the two remote components:
//! [`ConversationIndex`] (conversation-set queries, live feeds, two-party
//! create-or-find) and [`MessageLog`] (ordered message append/list/subscribe
//! with encrypt-on-write / decrypt-on-read).

pub mod conversations;
pub mod docs;
pub mod memory;
pub mod messages;
pub mod store;

mod error;

pub use conversations::ConversationIndex;
pub use error::RemoteError;
pub use memory::{MemoryBlobStore, MemoryStore};
pub use messages::{MessageDraft, MessageLog};
pub use store::{
    BlobHandle, Document, DocumentStore, Fields, Filter, ObjectStore, OrderBy, Query,
    SnapshotReceiver, Subscription, SERVER_TIMESTAMP,
};
