//! Abstract interface to the hosted document store and object store.
//!
//! The store is the source of truth; everything local is a mirror.  Live
//! queries deliver *full result snapshots* on every underlying change, never
//! deltas, so consumers can treat each push as authoritative and replace
//! their state wholesale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Sentinel field value replaced by the store with its own clock on write.
///
/// Creation times are stamped by the store, not the client, to keep
/// cross-client ordering consistent.
pub const SERVER_TIMESTAMP: &str = "__server_timestamp__";

/// Raw field map of a remote document.
pub type Fields = serde_json::Map<String, Value>;

/// One remote document: store-assigned id plus schemaless fields.
///
/// Typed mapping to domain records happens in [`crate::docs`], which fails
/// loudly on missing required fields instead of silently defaulting.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

/// A single query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the given value.
    Eq { field: String, value: Value },
    /// Field is an array containing the given value.
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn array_contains(field: &str, value: impl Into<Value>) -> Self {
        Self::ArrayContains {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

/// Result ordering.  Combining a filter with an ordering requires a
/// composite index on the store side; stores without one fail the query
/// with [`RemoteError::IndexMissing`].
///
/// [`RemoteError::IndexMissing`]: crate::RemoteError::IndexMissing
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// A query against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: &str, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            descending,
        });
        self
    }
}

/// Receiving half of a live query: one `Vec<Document>` per snapshot.
pub type SnapshotReceiver = mpsc::UnboundedReceiver<Vec<Document>>;

/// Cancellation handle for a live query.
///
/// Cancellation is idempotent (double-cancel is a no-op) and detaches the
/// consumer from future pushes.  It is not instantaneous with respect to an
/// update already in flight: one stale snapshot may still be observed after
/// `cancel` returns, and callers must tolerate it.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The hosted document store, reduced to the operation shapes the sync core
/// needs.  Implementations must replace [`SERVER_TIMESTAMP`] sentinels with
/// their own clock on `create` and `update`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a one-shot query.
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Fetch a single document, `None` if absent.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Create a document; the store assigns and returns its id.
    async fn create(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Merge partial fields into an existing document.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Establish a live query.  The receiver gets the current result set
    /// immediately, then a full snapshot on every subsequent change.
    async fn subscribe(&self, query: &Query) -> Result<(SnapshotReceiver, Subscription)>;
}

/// Opaque reference to an uploaded binary object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub path: String,
}

/// The hosted binary object store, used for message attachments.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes under a path, returning a handle.
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobHandle>;

    /// Resolve a handle to a publicly fetchable URI.
    fn public_url(&self, handle: &BlobHandle) -> String;
}
