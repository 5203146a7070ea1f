//! Per-direction checkpoint persistence.
//!
//! The checkpoint of a direction is stored as a regular document in a
//! collaborator [`DocumentStore`], keyed by `<checkpoint key>-<direction>`.
//! Without a collaborator the checkpoint lives in memory only and the
//! replication restarts from scratch on every run.

use crate::error::{ReplicationError, ReplicationResult};
use forkdb_storage::{
    CheckpointValue, DocumentMeta, DocumentState, DocumentStore, Revision, WriteErrorKind, WriteRow,
};
use forkdb_sync_protocol::{lwt_now, next_revision, CheckpointKey, Direction, HashFunction};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

const CHECKPOINT_FIELD: &str = "checkpoint";

#[derive(Debug, Clone)]
struct Cached<C> {
    value: Option<C>,
    document: Option<DocumentState>,
}

/// Checkpoint storage for one direction.
pub(crate) struct CheckpointStore<C> {
    direction: Direction,
    document_id: String,
    backend: Option<Arc<dyn DocumentStore>>,
    hash_function: HashFunction,
    initial: Option<C>,
    cache: Mutex<Option<Cached<C>>>,
}

impl<C: CheckpointValue> CheckpointStore<C> {
    pub(crate) fn new(
        key: &CheckpointKey,
        direction: Direction,
        backend: Option<Arc<dyn DocumentStore>>,
        hash_function: HashFunction,
    ) -> Self {
        Self {
            direction,
            document_id: key.document_id(direction),
            backend,
            hash_function,
            initial: None,
            cache: Mutex::new(None),
        }
    }

    /// Starts from `initial` while no checkpoint document exists.
    pub(crate) fn with_initial(mut self, initial: Option<C>) -> Self {
        self.initial = initial;
        self
    }

    /// Returns the primary key of the checkpoint document.
    pub(crate) fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Returns the current checkpoint, loading it on first use.
    pub(crate) async fn get(&self) -> ReplicationResult<Option<C>> {
        if let Some(cached) = self.cache.lock().as_ref() {
            return Ok(cached.value.clone());
        }

        let loaded = match &self.backend {
            Some(backend) => {
                let found = backend
                    .find_documents_by_id(&[self.document_id.clone()])
                    .await?;
                match found.get(&self.document_id) {
                    Some(doc) => Cached {
                        value: decode(doc)?,
                        document: Some(doc.clone()),
                    },
                    None => Cached {
                        value: self.initial.clone(),
                        document: None,
                    },
                }
            }
            None => Cached {
                value: self.initial.clone(),
                document: None,
            },
        };

        let value = loaded.value.clone();
        let mut cache = self.cache.lock();
        // A concurrent set() wins over the loaded state.
        if cache.is_none() {
            *cache = Some(loaded);
            Ok(value)
        } else {
            Ok(cache.as_ref().and_then(|c| c.value.clone()))
        }
    }

    /// Persists `value` as the new checkpoint.
    ///
    /// When the stored checkpoint changed underneath, the stored one is
    /// adopted if it is not behind `value`; otherwise
    /// [`ReplicationError::CheckpointConflict`] is returned and the cache is
    /// reset to the stored state.
    pub(crate) async fn set(&self, value: C) -> ReplicationResult<()> {
        let Some(backend) = &self.backend else {
            *self.cache.lock() = Some(Cached {
                value: Some(value),
                document: None,
            });
            return Ok(());
        };

        let previous = self.cache.lock().as_ref().and_then(|c| c.document.clone());
        let mut data = Map::new();
        data.insert(CHECKPOINT_FIELD.to_string(), serde_json::to_value(&value)?);
        let mut document = DocumentState::new(
            self.document_id.clone(),
            Revision::new(1, "pending"),
            data,
        );
        document.revision = next_revision(
            &self.hash_function,
            &document,
            previous.as_ref().map(|p| &p.revision),
        )?;
        document.meta = DocumentMeta::with_lwt(lwt_now());

        let mut response = backend
            .bulk_write(vec![WriteRow {
                previous,
                document,
            }])
            .await?;

        if let Some(stored) = response.success.remove(&self.document_id) {
            *self.cache.lock() = Some(Cached {
                value: Some(value),
                document: Some(stored),
            });
            return Ok(());
        }

        let Some(error) = response.error.remove(&self.document_id) else {
            return Ok(());
        };
        if let WriteErrorKind::Other(message) = error.kind {
            return Err(ReplicationError::write_rejected(
                self.direction,
                self.document_id.clone(),
                message,
            ));
        }

        let stored_doc = error.document_in_db;
        let stored_value = match &stored_doc {
            Some(doc) => decode::<C>(doc)?,
            None => None,
        };
        let stored_is_ahead = matches!(
            stored_value.as_ref().and_then(|s| s.partial_cmp(&value)),
            Some(Ordering::Greater | Ordering::Equal)
        );
        *self.cache.lock() = Some(Cached {
            value: stored_value,
            document: stored_doc,
        });

        if stored_is_ahead {
            debug!(
                direction = %self.direction,
                "stored checkpoint is ahead; adopting it"
            );
            Ok(())
        } else {
            Err(ReplicationError::CheckpointConflict {
                direction: self.direction,
            })
        }
    }
}

fn decode<C: CheckpointValue>(doc: &DocumentState) -> ReplicationResult<Option<C>> {
    if doc.deleted {
        return Ok(None);
    }
    match doc.data.get(CHECKPOINT_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
    }
}
