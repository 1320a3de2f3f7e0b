//! In-process [`DocumentStore`] / [`ObjectStore`] implementations.
//!
//! Used by the test suites and by local development without a hosted
//! backend.  Semantics mirror the hosted store at the interface boundary:
//! server-assigned creation stamps (strictly increasing), full-snapshot
//! pushes on every mutation, and an `IndexMissing` failure whenever a query
//! combines a filter with an ordering while the composite index is absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{RemoteError, Result};
use crate::store::{
    BlobHandle, Document, DocumentStore, Fields, Filter, ObjectStore, Query, SnapshotReceiver,
    Subscription, SERVER_TIMESTAMP,
};

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<Document>>,
    handle: Subscription,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Document>>,
    subscribers: Vec<Subscriber>,
    last_stamp: Option<DateTime<Utc>>,
}

/// In-memory document store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    composite_index: bool,
    offline: AtomicBool,
}

impl MemoryStore {
    /// A store with the by-filter-and-by-order composite index available.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            composite_index: true,
            offline: AtomicBool::new(false),
        }
    }

    /// A store lacking the composite index: queries combining a filter with
    /// an ordering fail with [`RemoteError::IndexMissing`].
    pub fn without_composite_index() -> Self {
        Self {
            composite_index: false,
            ..Self::new()
        }
    }

    /// Simulate loss of connectivity: every operation fails with
    /// [`RemoteError::Unavailable`] until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Insert a document under a caller-chosen id, for fixtures where the
    /// id is externally assigned (identity records keyed by user id).
    pub fn seed(&self, collection: &str, id: &str, mut fields: Fields) {
        let mut inner = self.lock();
        let stamp = Self::next_stamp(&mut inner);
        for value in fields.values_mut() {
            resolve_timestamps(value, &stamp);
        }
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(Document {
                id: id.to_string(),
                fields,
            });
        Self::notify(&mut inner, collection);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            Err(RemoteError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_index(&self, query: &Query) -> Result<()> {
        if !self.composite_index && query.order_by.is_some() && !query.filters.is_empty() {
            return Err(RemoteError::IndexMissing);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next server clock stamp, strictly greater than every previous one.
    fn next_stamp(inner: &mut Inner) -> String {
        let mut now = Utc::now();
        if let Some(last) = inner.last_stamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        inner.last_stamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Push a fresh snapshot to every live subscriber of `collection`,
    /// pruning cancelled ones.
    fn notify(inner: &mut Inner, collection: &str) {
        inner.subscribers.retain(|s| !s.handle.is_cancelled());

        let docs = inner
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();

        for sub in &inner.subscribers {
            if sub.query.collection != collection {
                continue;
            }
            let snapshot = evaluate(&sub.query, &docs);
            // A closed receiver is cleaned up on the next notify pass.
            let _ = sub.tx.send(snapshot);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.check_online()?;
        self.check_index(query)?;

        let inner = self.lock();
        let docs = inner
            .collections
            .get(&query.collection)
            .cloned()
            .unwrap_or_default();
        Ok(evaluate(query, &docs))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.check_online()?;

        let inner = self.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    async fn create(&self, collection: &str, mut fields: Fields) -> Result<String> {
        self.check_online()?;

        let mut inner = self.lock();
        let stamp = Self::next_stamp(&mut inner);
        for value in fields.values_mut() {
            resolve_timestamps(value, &stamp);
        }

        let id = Uuid::new_v4().to_string();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(Document {
                id: id.clone(),
                fields,
            });

        Self::notify(&mut inner, collection);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, mut fields: Fields) -> Result<()> {
        self.check_online()?;

        let mut inner = self.lock();
        let stamp = Self::next_stamp(&mut inner);
        for value in fields.values_mut() {
            resolve_timestamps(value, &stamp);
        }

        let doc = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        for (key, value) in fields {
            doc.fields.insert(key, value);
        }

        Self::notify(&mut inner, collection);
        Ok(())
    }

    async fn subscribe(&self, query: &Query) -> Result<(SnapshotReceiver, Subscription)> {
        self.check_online()?;
        self.check_index(query)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Subscription::new();

        let mut inner = self.lock();
        let docs = inner
            .collections
            .get(&query.collection)
            .cloned()
            .unwrap_or_default();
        // Initial snapshot fires immediately, like the hosted store.
        let _ = tx.send(evaluate(query, &docs));

        inner.subscribers.push(Subscriber {
            query: query.clone(),
            tx,
            handle: handle.clone(),
        });

        Ok((rx, handle))
    }
}

fn evaluate(query: &Query, docs: &[Document]) -> Vec<Document> {
    let mut matched: Vec<Document> = docs
        .iter()
        .filter(|doc| query.filters.iter().all(|f| matches(f, doc)))
        .cloned()
        .collect();

    if let Some(order) = &query.order_by {
        // Stable sort: documents with equal keys keep insertion order.
        matched.sort_by(|a, b| {
            let ord = compare_values(a.fields.get(&order.field), b.fields.get(&order.field));
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
    matched
}

fn matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::Eq { field, value } => doc.fields.get(field) == Some(value),
        Filter::ArrayContains { field, value } => doc
            .fields
            .get(field)
            .and_then(Value::as_array)
            .map(|arr| arr.contains(value))
            .unwrap_or(false),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn resolve_timestamps(value: &mut Value, stamp: &str) {
    match value {
        Value::String(s) if s == SERVER_TIMESTAMP => *value = Value::String(stamp.to_string()),
        Value::Object(map) => {
            for v in map.values_mut() {
                resolve_timestamps(v, stamp);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                resolve_timestamps(v, stamp);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

/// In-memory object store for attachments.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Stored bytes for a path, for test assertions.
    pub fn bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobHandle> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(RemoteError::Upload("object store offline".to_string()));
        }
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), bytes.to_vec());
        Ok(BlobHandle {
            path: path.to_string(),
        })
    }

    fn public_url(&self, handle: &BlobHandle) -> String {
        format!("memory://{}", handle.path)
    }
}
