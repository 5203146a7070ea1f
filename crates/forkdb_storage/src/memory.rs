//! In-memory storage instance.

use crate::backend::{
    BulkWriteResponse, ChangedDocument, DocumentStore, StorageIdentity, StorageInstance,
    WriteError, WriteRow,
};
use crate::change_feed::{ChangeEvent, EventBulk};
use crate::document::DocumentState;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Default capacity of the change stream channel.
pub const DEFAULT_CHANGE_STREAM_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredDocument {
    state: DocumentState,
    sequence: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<String, StoredDocument>,
    last_sequence: u64,
}

/// A storage instance that keeps all documents in memory.
///
/// Every accepted write is assigned a monotonically increasing sequence
/// number, which doubles as the change-feed checkpoint. Only the latest state
/// per primary key is kept, so enumerating changes skips superseded states.
///
/// # Thread Safety
///
/// The instance is `Send + Sync`; wrap it in an `Arc` to share it between a
/// replication and the application.
///
/// # Example
///
/// ```rust
/// use forkdb_storage::{DocumentState, DocumentStore, InMemoryStorage, Revision, WriteRow};
///
/// # tokio_test_block(async {
/// let storage = InMemoryStorage::new("app", "todos");
/// let doc = DocumentState::new("a", Revision::new(1, "x"), Default::default());
/// let response = storage.bulk_write(vec![WriteRow::insert(doc)]).await.unwrap();
/// assert!(response.is_clean());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryStorage {
    identity: StorageIdentity,
    state: RwLock<MemoryState>,
    changes: broadcast::Sender<EventBulk>,
    closed: AtomicBool,
}

impl InMemoryStorage {
    /// Creates an empty instance for the given database and collection.
    #[must_use]
    pub fn new(database_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self::with_identity(StorageIdentity::new(
            "memory",
            database_name,
            collection_name,
        ))
    }

    /// Creates an empty instance with an explicit identity.
    #[must_use]
    pub fn with_identity(identity: StorageIdentity) -> Self {
        Self::with_capacity(identity, DEFAULT_CHANGE_STREAM_CAPACITY)
    }

    /// Creates an empty instance with a custom change stream capacity.
    ///
    /// Subscribers that fall more than `capacity` bulks behind observe a
    /// lagged receive.
    #[must_use]
    pub fn with_capacity(identity: StorageIdentity, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            identity,
            state: RwLock::new(MemoryState::default()),
            changes,
            closed: AtomicBool::new(false),
        }
    }

    /// Closes the instance. Later calls fail with [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true if the instance was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the stored state of a document, including tombstones.
    pub fn get(&self, primary_key: &str) -> Option<DocumentState> {
        self.state
            .read()
            .documents
            .get(primary_key)
            .map(|stored| stored.state.clone())
    }

    /// Returns all stored states ordered by primary key.
    pub fn documents(&self) -> Vec<DocumentState> {
        self.state
            .read()
            .documents
            .values()
            .map(|stored| stored.state.clone())
            .collect()
    }

    /// Returns the number of stored documents, including tombstones.
    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    /// Returns true if no document is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the sequence number of the latest accepted write.
    pub fn last_sequence(&self) -> u64 {
        self.state.read().last_sequence
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

fn previous_matches(previous: Option<&DocumentState>, stored: Option<&StoredDocument>) -> bool {
    match (previous, stored) {
        (None, None) => true,
        (Some(previous), Some(stored)) => previous.revision == stored.state.revision,
        _ => false,
    }
}

#[async_trait]
impl DocumentStore for InMemoryStorage {
    async fn bulk_write(&self, rows: Vec<WriteRow>) -> StorageResult<BulkWriteResponse> {
        self.ensure_open()?;

        let mut response = BulkWriteResponse::default();
        let mut bulk = EventBulk::default();
        {
            let mut state = self.state.write();
            for row in rows {
                let key = row.primary_key().to_string();
                let stored = state.documents.get(&key);
                if !previous_matches(row.previous.as_ref(), stored) {
                    let in_db = stored.map(|s| s.state.clone());
                    response.error.insert(key, WriteError::conflict(row, in_db));
                    continue;
                }

                state.last_sequence += 1;
                let sequence = state.last_sequence;
                let replaced = state.documents.insert(
                    key.clone(),
                    StoredDocument {
                        state: row.document.clone(),
                        sequence,
                    },
                );
                bulk.events.push(ChangeEvent::from_write(
                    row.document.clone(),
                    replaced.map(|r| r.state),
                ));
                response.success.insert(key, row.document);
            }
        }

        if !bulk.is_empty() {
            // No subscribers is not an error.
            let _ = self.changes.send(bulk);
        }
        Ok(response)
    }

    async fn find_documents_by_id(
        &self,
        ids: &[String],
    ) -> StorageResult<BTreeMap<String, DocumentState>> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .documents
                    .get(id)
                    .map(|stored| (id.clone(), stored.state.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl StorageInstance for InMemoryStorage {
    type Checkpoint = u64;

    fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&u64>,
    ) -> StorageResult<Vec<ChangedDocument<u64>>> {
        self.ensure_open()?;
        let after = checkpoint.copied().unwrap_or(0);
        let state = self.state.read();
        let mut changed: Vec<&StoredDocument> = state
            .documents
            .values()
            .filter(|stored| stored.sequence > after)
            .collect();
        changed.sort_by_key(|stored| stored.sequence);
        Ok(changed
            .into_iter()
            .take(limit)
            .map(|stored| ChangedDocument {
                document: stored.state.clone(),
                checkpoint: stored.sequence,
            })
            .collect())
    }

    fn change_stream(&self) -> broadcast::Receiver<EventBulk> {
        self.changes.subscribe()
    }
}
