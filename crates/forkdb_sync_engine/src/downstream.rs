//! Master to fork replication.
//!
//! A pass drains master's change feed from the down checkpoint in batches of
//! `bulk_size`. Each master state is copied into fork with the current fork
//! document as `previous` when fork holds no unreplicated write, and with the
//! branch state (the last known master state) otherwise. The storage rejects
//! the latter whenever fork moved on, which routes real conflicts through the
//! conflict handler.

use crate::error::{ReplicationError, ReplicationResult};
use crate::rows::{fork_copy_of_master, resolved_state};
use crate::state::Inner;
use forkdb_storage::{DocumentState, ReplicationFlags, StorageInstance, WriteErrorKind, WriteRow};
use forkdb_sync_protocol::{meta, CheckpointKey, ConflictInput, ConflictOutput, Direction};
use tracing::debug;

/// Runs one downstream pass.
pub(crate) async fn run_pass<M, F>(inner: &Inner<M, F>) -> ReplicationResult<()>
where
    M: StorageInstance,
    F: StorageInstance,
{
    let bulk_size = inner.config.bulk_size;
    loop {
        inner.ensure_active()?;
        let checkpoint = inner.checkpoint_down.get().await?;
        let changes = inner
            .master
            .get_changed_documents_since(bulk_size, checkpoint.as_ref())
            .await?;
        let fetched = changes.len();
        debug!(
            direction = %Direction::Down,
            checkpoint_key = %inner.key,
            count = fetched,
            "fetched master changes"
        );

        // Checkpoint documents stored alongside replicated ones reappear after
        // every checkpoint write.
        let only_checkpoints = changes
            .iter()
            .all(|c| inner.is_checkpoint_document(&c.document.primary_key));
        let Some(last_checkpoint) = changes.last().map(|c| c.checkpoint.clone()) else {
            break;
        };
        let documents = changes.into_iter().map(|c| c.document).collect();
        let written = apply_batch(inner, documents).await?;
        inner.events.processed(Direction::Down, written);

        // An interrupted batch is replayed by the next run.
        inner.ensure_active()?;
        inner.checkpoint_down.set(last_checkpoint).await?;

        if fetched < bulk_size || only_checkpoints {
            break;
        }
    }
    inner.mark_first_sync(Direction::Down);
    Ok(())
}

async fn apply_batch<M, F>(
    inner: &Inner<M, F>,
    master_documents: Vec<DocumentState>,
) -> ReplicationResult<Vec<DocumentState>>
where
    M: StorageInstance,
    F: StorageInstance,
{
    let key = &inner.key;
    let candidates: Vec<DocumentState> = master_documents
        .into_iter()
        .filter(|m| !inner.is_checkpoint_document(&m.primary_key))
        // Written by our own upstream loop.
        .filter(|m| meta::origin_is_fork(m, key) != Some(&m.revision))
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = candidates.iter().map(|m| m.primary_key.clone()).collect();
    let current = inner.fork.find_documents_by_id(&ids).await?;

    let mut rows = Vec::with_capacity(candidates.len());
    for master in &candidates {
        let fork_doc = current.get(&master.primary_key);
        if fork_doc.is_some_and(|f| f.revision == master.revision || knows_newer(key, f, master)) {
            continue;
        }
        let previous = match fork_doc {
            None => None,
            Some(f) if meta::is_in_sync_with_master(f, key) => Some(f.clone()),
            Some(f) => meta::last_known_master_state(f, key).cloned(),
        };
        rows.push(WriteRow {
            previous,
            document: fork_copy_of_master(key, master, fork_doc),
        });
    }

    write_resolving_conflicts(inner, rows).await
}

/// Returns true if `fork` already knows `master` or a later master state.
///
/// Master states read before an upstream push completed are older than what
/// the push recorded on fork and must not overwrite it.
fn knows_newer(key: &CheckpointKey, fork: &DocumentState, master: &DocumentState) -> bool {
    meta::last_known_master_state(fork, key)
        .is_some_and(|known| known.revision.height() >= master.revision.height())
}

/// Writes rows into fork, resolving conflicts until no row is left.
async fn write_resolving_conflicts<M, F>(
    inner: &Inner<M, F>,
    mut rows: Vec<WriteRow>,
) -> ReplicationResult<Vec<DocumentState>>
where
    M: StorageInstance,
    F: StorageInstance,
{
    let key = &inner.key;
    let mut written = Vec::new();

    while !rows.is_empty() {
        inner.ensure_active()?;
        let response = inner.fork.bulk_write(std::mem::take(&mut rows)).await?;
        written.extend(response.success.into_values());

        for (primary_key, error) in response.error {
            if let WriteErrorKind::Other(message) = error.kind {
                return Err(ReplicationError::write_rejected(
                    Direction::Down,
                    primary_key,
                    message,
                ));
            }

            let document = error.write_row.document;
            let Some(master) = meta::last_known_master_state(&document, key).cloned() else {
                continue;
            };
            let Some(stored) = error.document_in_db else {
                // Removed from fork in the meantime.
                rows.push(WriteRow::insert(document));
                continue;
            };

            if stored.revision == master.revision || knows_newer(key, &stored, &master) {
                debug!(
                    direction = %Direction::Down,
                    primary_key = %primary_key,
                    revision = %master.revision,
                    "dropping stale master state"
                );
                continue;
            }

            if meta::is_in_sync_with_master(&stored, key) {
                // Fork changed, but only through replication.
                let next = fork_copy_of_master(key, &master, Some(&stored));
                rows.push(WriteRow::update(stored, next));
                continue;
            }

            let input = ConflictInput::new(
                meta::last_known_master_state(&stored, key),
                &master,
                &stored,
            );
            let next = match inner.resolve_conflict(Direction::Down, input) {
                ConflictOutput::AlreadyEqual => fork_copy_of_master(key, &master, Some(&stored)),
                ConflictOutput::Resolved(resolved) => {
                    let mut doc =
                        resolved_state(&inner.hash_function, resolved, &stored, &master, &stored)?;
                    *meta::flags_mut(&mut doc, key) = ReplicationFlags {
                        last_known_master_state: Some(Box::new(master)),
                        ..Default::default()
                    };
                    doc
                }
            };
            rows.push(WriteRow::update(stored, next));
        }
    }

    Ok(written)
}
