//! Test fixtures and storage helpers.
//!
//! Provides document builders, application-style writes with computed
//! revisions, and an instrumented storage wrapper.

use async_trait::async_trait;
use forkdb_storage::{
    BulkWriteResponse, ChangedDocument, DocumentMeta, DocumentState, DocumentStore, EventBulk,
    InMemoryStorage, Revision, StorageError, StorageIdentity, StorageInstance, StorageResult,
    WriteError, WriteErrorKind, WriteRow,
};
use forkdb_sync_protocol::{default_hash_function, lwt_now, next_revision};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Turns a JSON value into document fields.
///
/// Objects are used as-is; any other value is stored under `"value"`.
pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Builds a live document with a content-derived first revision.
pub fn document(primary_key: &str, data: Value) -> DocumentState {
    let mut doc = DocumentState::new(primary_key, Revision::new(1, ""), fields(data));
    doc.meta = DocumentMeta::with_lwt(lwt_now());
    if let Ok(revision) = next_revision(&default_hash_function(), &doc, None) {
        doc.revision = revision;
    }
    doc
}

/// Builds a document with a fixed revision such as `"3-abc"`.
///
/// # Panics
///
/// Panics if `revision` is not a valid revision string.
pub fn document_at(primary_key: &str, revision: &str, data: Value) -> DocumentState {
    let revision: Revision = revision.parse().expect("invalid revision in fixture");
    DocumentState::new(primary_key, revision, fields(data))
}

/// Creates a master and a fork instance with distinct identities.
pub fn paired_storages() -> (Arc<InMemoryStorage>, Arc<InMemoryStorage>) {
    (
        Arc::new(InMemoryStorage::new("master", "docs")),
        Arc::new(InMemoryStorage::new("fork", "docs")),
    )
}

/// Writes `data` the way an application would.
///
/// Reads the stored state, computes the next revision and writes with the
/// stored state as `previous`, retrying when a concurrent write got in
/// between. Replication flags of the stored state are kept.
pub async fn write_local<S>(store: &S, primary_key: &str, data: Value) -> StorageResult<DocumentState>
where
    S: DocumentStore + ?Sized,
{
    write_with(store, primary_key, |doc| {
        doc.deleted = false;
        doc.data = fields(data.clone());
    })
    .await
}

/// Deletes a document the way an application would, leaving a tombstone.
pub async fn delete_local<S>(store: &S, primary_key: &str) -> StorageResult<DocumentState>
where
    S: DocumentStore + ?Sized,
{
    write_with(store, primary_key, |doc| {
        doc.deleted = true;
        doc.data = Map::new();
    })
    .await
}

async fn write_with<S>(
    store: &S,
    primary_key: &str,
    change: impl Fn(&mut DocumentState),
) -> StorageResult<DocumentState>
where
    S: DocumentStore + ?Sized,
{
    let hash_function = default_hash_function();
    let ids = [primary_key.to_string()];
    loop {
        let current = store.find_documents_by_id(&ids).await?.remove(primary_key);
        let mut doc = current
            .clone()
            .unwrap_or_else(|| DocumentState::new(primary_key, Revision::new(1, ""), Map::new()));
        change(&mut doc);
        doc.meta.lwt = lwt_now();
        doc.revision = next_revision(
            &hash_function,
            &doc,
            current.as_ref().map(|c| &c.revision),
        )
        .map_err(|e| StorageError::backend(e.to_string()))?;

        let row = WriteRow {
            previous: current,
            document: doc,
        };
        let mut response = store.bulk_write(vec![row]).await?;
        if let Some(written) = response.success.remove(primary_key) {
            return Ok(written);
        }
        match response.error.remove(primary_key).map(|e| e.kind) {
            Some(WriteErrorKind::Conflict) => continue,
            Some(WriteErrorKind::Other(message)) => return Err(StorageError::Backend(message)),
            None => return Err(StorageError::backend("write was not acknowledged")),
        }
    }
}

/// A failure injected into a [`CountingStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Every `bulk_write` call fails as a whole.
    Call(String),
    /// Every row of a `bulk_write` is rejected with a non-conflict error.
    Rows(String),
    /// Every `bulk_write` call waits forever.
    Stall,
}

/// Application writes applied right before the next `bulk_write` calls that
/// touch `primary_key`, one per call.
struct Interference {
    primary_key: String,
    writes: VecDeque<Value>,
}

/// Storage wrapper counting bulk writes and injecting failures.
///
/// Reads and the change stream are passed through unchanged. Writes queued
/// with [`interfere`](CountingStorage::interfere) simulate another client
/// racing the caller.
pub struct CountingStorage<S> {
    inner: Arc<S>,
    bulk_writes: AtomicUsize,
    written_rows: AtomicUsize,
    changes_fetched: AtomicUsize,
    failure: Mutex<Option<InjectedFailure>>,
    interference: Mutex<Option<Interference>>,
}

impl<S> CountingStorage<S> {
    /// Wraps `inner`.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            bulk_writes: AtomicUsize::new(0),
            written_rows: AtomicUsize::new(0),
            changes_fetched: AtomicUsize::new(0),
            failure: Mutex::new(None),
            interference: Mutex::new(None),
        }
    }

    /// Returns the wrapped storage.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Number of `bulk_write` calls that reached the wrapped storage.
    pub fn bulk_write_count(&self) -> usize {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    /// Number of rows the wrapped storage accepted.
    pub fn written_rows(&self) -> usize {
        self.written_rows.load(Ordering::SeqCst)
    }

    /// Number of documents returned by change enumeration.
    pub fn changes_fetched(&self) -> usize {
        self.changes_fetched.load(Ordering::SeqCst)
    }

    /// Resets all counters.
    pub fn reset_counts(&self) {
        self.bulk_writes.store(0, Ordering::SeqCst);
        self.written_rows.store(0, Ordering::SeqCst);
        self.changes_fetched.store(0, Ordering::SeqCst);
    }

    /// Makes later writes fail until [`heal`](Self::heal) is called.
    pub fn inject(&self, failure: InjectedFailure) {
        *self.failure.lock() = Some(failure);
    }

    /// Removes an injected failure.
    pub fn heal(&self) {
        *self.failure.lock() = None;
    }

    /// Queues concurrent writes of `primary_key`.
    ///
    /// Each later `bulk_write` with a row for `primary_key` first writes the
    /// next queued fields to the wrapped storage, so the row finds a newer
    /// state than it expects.
    pub fn interfere(&self, primary_key: &str, writes: Vec<Value>) {
        *self.interference.lock() = Some(Interference {
            primary_key: primary_key.to_string(),
            writes: writes.into(),
        });
    }

    /// Number of queued concurrent writes not applied yet.
    pub fn pending_interference(&self) -> usize {
        self.interference
            .lock()
            .as_ref()
            .map_or(0, |i| i.writes.len())
    }

    fn next_interference(&self, rows: &[WriteRow]) -> Option<(String, Value)> {
        let mut guard = self.interference.lock();
        let interference = guard.as_mut()?;
        if !rows
            .iter()
            .any(|row| row.primary_key() == interference.primary_key)
        {
            return None;
        }
        let data = interference.writes.pop_front()?;
        Some((interference.primary_key.clone(), data))
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for CountingStorage<S> {
    async fn bulk_write(&self, rows: Vec<WriteRow>) -> StorageResult<BulkWriteResponse> {
        let failure = self.failure.lock().clone();
        match failure {
            Some(InjectedFailure::Call(message)) => Err(StorageError::Backend(message)),
            Some(InjectedFailure::Stall) => std::future::pending().await,
            Some(InjectedFailure::Rows(message)) => {
                let error: BTreeMap<String, WriteError> = rows
                    .into_iter()
                    .map(|row| {
                        (
                            row.primary_key().to_string(),
                            WriteError::other(row, message.clone()),
                        )
                    })
                    .collect();
                Ok(BulkWriteResponse {
                    success: BTreeMap::new(),
                    error,
                })
            }
            None => {
                if let Some((primary_key, data)) = self.next_interference(&rows) {
                    write_local(self.inner.as_ref(), &primary_key, data).await?;
                }
                self.bulk_writes.fetch_add(1, Ordering::SeqCst);
                let response = self.inner.bulk_write(rows).await?;
                self.written_rows
                    .fetch_add(response.success.len(), Ordering::SeqCst);
                Ok(response)
            }
        }
    }

    async fn find_documents_by_id(
        &self,
        ids: &[String],
    ) -> StorageResult<BTreeMap<String, DocumentState>> {
        self.inner.find_documents_by_id(ids).await
    }
}

#[async_trait]
impl<S: StorageInstance> StorageInstance for CountingStorage<S> {
    type Checkpoint = S::Checkpoint;

    fn identity(&self) -> &StorageIdentity {
        self.inner.identity()
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Self::Checkpoint>,
    ) -> StorageResult<Vec<ChangedDocument<Self::Checkpoint>>> {
        let changes = self.inner.get_changed_documents_since(limit, checkpoint).await?;
        self.changes_fetched.fetch_add(changes.len(), Ordering::SeqCst);
        Ok(changes)
    }

    fn change_stream(&self) -> broadcast::Receiver<EventBulk> {
        self.inner.change_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_local_chains_revisions() {
        let store = InMemoryStorage::new("app", "docs");
        let first = write_local(&store, "a", json!({"n": 1})).await.unwrap();
        let second = write_local(&store, "a", json!({"n": 2})).await.unwrap();
        assert_eq!(first.revision.height(), 1);
        assert_eq!(second.revision.height(), 2);
        assert!(second.meta.lwt > first.meta.lwt);
        assert_eq!(store.get("a").unwrap().get("n"), Some(&json!(2)));

        let deleted = delete_local(&store, "a").await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.revision.height(), 3);
    }

    #[tokio::test]
    async fn counting_storage_counts_and_fails() {
        let storage = CountingStorage::new(Arc::new(InMemoryStorage::new("app", "docs")));
        write_local(&storage, "a", json!({"n": 1})).await.unwrap();
        assert_eq!(storage.bulk_write_count(), 1);
        assert_eq!(storage.written_rows(), 1);

        storage.inject(InjectedFailure::Rows("disk full".into()));
        let err = write_local(&storage, "b", json!({"n": 1})).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(m) if m == "disk full"));

        storage.inject(InjectedFailure::Call("offline".into()));
        assert!(write_local(&storage, "b", json!({})).await.is_err());
        assert_eq!(storage.bulk_write_count(), 1);

        storage.heal();
        storage.reset_counts();
        write_local(&storage, "b", json!({"n": 2})).await.unwrap();
        assert_eq!(storage.bulk_write_count(), 1);
        assert!(storage.inner().get("b").is_some());
    }

    #[tokio::test]
    async fn stalled_storage_never_answers() {
        let storage = CountingStorage::new(Arc::new(InMemoryStorage::new("app", "docs")));
        storage.inject(InjectedFailure::Stall);
        let write = write_local(&storage, "a", json!({"n": 1}));
        let waited = tokio::time::timeout(std::time::Duration::from_millis(20), write).await;
        assert!(waited.is_err());
        assert!(storage.inner().get("a").is_none());
    }

    #[tokio::test]
    async fn interference_races_matching_writes() {
        let storage = CountingStorage::new(Arc::new(InMemoryStorage::new("app", "docs")));
        write_local(&storage, "a", json!({"n": 1})).await.unwrap();
        storage.interfere("a", vec![json!({"other": 1}), json!({"other": 2})]);

        // Unrelated keys leave the queue alone.
        write_local(&storage, "b", json!({"n": 1})).await.unwrap();
        assert_eq!(storage.pending_interference(), 2);

        // The first attempt loses to the queued write, the retry to the second.
        let written = write_local(&storage, "a", json!({"n": 2})).await.unwrap();
        assert_eq!(storage.pending_interference(), 0);
        assert_eq!(written.revision.height(), 4);
        assert_eq!(written.get("n"), Some(&json!(2)));
    }

    #[test]
    fn fixture_documents() {
        let a = document("a", json!({"n": 1}));
        let b = document("a", json!({"n": 1}));
        assert_eq!(a.revision, b.revision);
        assert_eq!(a.revision.height(), 1);

        let scalar = document_at("s", "3-x", json!(5));
        assert_eq!(scalar.get("value"), Some(&json!(5)));
        assert_eq!(scalar.revision.height(), 3);
    }
}
