//! Storage contract definition.

use crate::change_feed::EventBulk;
use crate::document::DocumentState;
use crate::error::StorageResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tokio::sync::broadcast;

/// Identity of a storage instance.
///
/// Replication derives its checkpoint key from the identities of both sides,
/// so two instances that hold different data must not share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageIdentity {
    /// Name of the storage engine (e.g. `"memory"`).
    pub storage_name: String,
    /// Database name.
    pub database_name: String,
    /// Collection name.
    pub collection_name: String,
}

impl StorageIdentity {
    /// Creates a new identity.
    pub fn new(
        storage_name: impl Into<String>,
        database_name: impl Into<String>,
        collection_name: impl Into<String>,
    ) -> Self {
        Self {
            storage_name: storage_name.into(),
            database_name: database_name.into(),
            collection_name: collection_name.into(),
        }
    }
}

/// A single row of a bulk write.
///
/// `previous` must match the currently stored document (both absent, or the
/// same revision), otherwise the row is rejected with a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRow {
    /// The state the writer assumes is stored.
    pub previous: Option<DocumentState>,
    /// The state to store.
    pub document: DocumentState,
}

impl WriteRow {
    /// Creates a row that expects no stored document.
    pub fn insert(document: DocumentState) -> Self {
        Self {
            previous: None,
            document,
        }
    }

    /// Creates a row that replaces `previous`.
    pub fn update(previous: DocumentState, document: DocumentState) -> Self {
        Self {
            previous: Some(previous),
            document,
        }
    }

    /// Returns the primary key of the written document.
    pub fn primary_key(&self) -> &str {
        &self.document.primary_key
    }
}

/// Why a row of a bulk write was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// `previous` did not match the stored document.
    Conflict,
    /// Any other per-row failure (permissions, validation, ...).
    Other(String),
}

/// A rejected row of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    /// Primary key of the rejected row.
    pub primary_key: String,
    /// Rejection cause.
    pub kind: WriteErrorKind,
    /// The row that was rejected.
    pub write_row: WriteRow,
    /// The stored document at rejection time (set for conflicts).
    pub document_in_db: Option<DocumentState>,
}

impl WriteError {
    /// Creates a conflict error.
    pub fn conflict(write_row: WriteRow, document_in_db: Option<DocumentState>) -> Self {
        Self {
            primary_key: write_row.primary_key().to_string(),
            kind: WriteErrorKind::Conflict,
            write_row,
            document_in_db,
        }
    }

    /// Creates a non-conflict error.
    pub fn other(write_row: WriteRow, message: impl Into<String>) -> Self {
        Self {
            primary_key: write_row.primary_key().to_string(),
            kind: WriteErrorKind::Other(message.into()),
            write_row,
            document_in_db: None,
        }
    }

    /// Returns true if this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        self.kind == WriteErrorKind::Conflict
    }
}

/// Result of a bulk write: accepted and rejected rows by primary key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResponse {
    /// Stored states of the accepted rows.
    pub success: BTreeMap<String, DocumentState>,
    /// Rejected rows.
    pub error: BTreeMap<String, WriteError>,
}

impl BulkWriteResponse {
    /// Returns true if no row was rejected.
    pub fn is_clean(&self) -> bool {
        self.error.is_empty()
    }
}

/// A document returned by change enumeration, with the cursor after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedDocument<C> {
    /// Latest state of the changed document.
    pub document: DocumentState,
    /// Cursor positioned right after this change.
    pub checkpoint: C,
}

/// Bounds for an opaque storage cursor.
///
/// Cursors must be ordered so that a persisted checkpoint can be compared
/// with a competing one.
pub trait CheckpointValue:
    Clone + Debug + PartialOrd + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CheckpointValue for T where
    T: Clone + Debug + PartialOrd + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Document reads and writes with optimistic concurrency.
///
/// This is the subset of the storage contract a checkpoint store needs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Writes all rows, rejecting those whose `previous` does not match.
    ///
    /// # Errors
    ///
    /// Returns an error only when the call as a whole failed; per-row
    /// rejections are reported in [`BulkWriteResponse::error`].
    async fn bulk_write(&self, rows: Vec<WriteRow>) -> StorageResult<BulkWriteResponse>;

    /// Looks up documents by primary key, including deletion tombstones.
    ///
    /// Missing keys are absent from the returned map.
    async fn find_documents_by_id(
        &self,
        ids: &[String],
    ) -> StorageResult<BTreeMap<String, DocumentState>>;
}

/// A storage instance that can take part in replication.
///
/// # Invariants
///
/// - `get_changed_documents_since` returns changes ordered by checkpoint
///   ascending and is exhaustive up to `limit`
/// - every accepted write is eventually announced on `change_stream`
#[async_trait]
pub trait StorageInstance: DocumentStore {
    /// Opaque change-feed cursor.
    type Checkpoint: CheckpointValue;

    /// Returns the identity of this instance.
    fn identity(&self) -> &StorageIdentity;

    /// Returns up to `limit` changes after `checkpoint` (all changes when `None`).
    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Self::Checkpoint>,
    ) -> StorageResult<Vec<ChangedDocument<Self::Checkpoint>>>;

    /// Subscribes to write notifications.
    fn change_stream(&self) -> broadcast::Receiver<EventBulk>;
}
