//! Fork to master replication.
//!
//! A pass drains fork's change feed from the up checkpoint. Local writes are
//! pushed to master with the last known master state as `previous`, then the
//! accepted master state is echoed back into fork so neither loop replicates
//! it again.

use crate::error::{ReplicationError, ReplicationResult};
use crate::rows::{fork_copy_of_master, master_copy_of_fork, refresh_master_state, resolved_state};
use crate::state::Inner;
use forkdb_storage::{DocumentState, ReplicationFlags, StorageInstance, WriteErrorKind, WriteRow};
use forkdb_sync_protocol::{meta, CheckpointKey, ConflictInput, ConflictOutput, Direction};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct BatchOutcome {
    had_conflicts: bool,
    /// Documents whose resolution could not be stored on master.
    unresolved: Vec<String>,
}

/// Runs one upstream pass.
///
/// When conflicts were hit, the pass waits for the downstream queue to drain
/// and runs again, until a round completes without conflicts.
pub(crate) async fn run_pass<M, F>(inner: &Inner<M, F>) -> ReplicationResult<()>
where
    M: StorageInstance,
    F: StorageInstance,
{
    let bulk_size = inner.config.bulk_size;
    let mut unresolved: Vec<String> = Vec::new();

    loop {
        let mut had_conflicts = false;

        if !unresolved.is_empty() {
            inner.ensure_active()?;
            let documents = inner
                .fork
                .find_documents_by_id(&unresolved)
                .await?
                .into_values()
                .collect();
            let outcome = push_batch(inner, documents).await?;
            had_conflicts |= outcome.had_conflicts;
            unresolved = outcome.unresolved;
        }

        loop {
            inner.ensure_active()?;
            let checkpoint = inner.checkpoint_up.get().await?;
            let changes = inner
                .fork
                .get_changed_documents_since(bulk_size, checkpoint.as_ref())
                .await?;
            let fetched = changes.len();
            debug!(
                direction = %Direction::Up,
                checkpoint_key = %inner.key,
                count = fetched,
                "fetched fork changes"
            );

            let only_checkpoints = changes
                .iter()
                .all(|c| inner.is_checkpoint_document(&c.document.primary_key));
            let Some(last_checkpoint) = changes.last().map(|c| c.checkpoint.clone()) else {
                break;
            };
            let documents = changes.into_iter().map(|c| c.document).collect();
            let outcome = push_batch(inner, documents).await?;
            had_conflicts |= outcome.had_conflicts;
            unresolved.extend(outcome.unresolved);

            inner.ensure_active()?;
            inner.checkpoint_up.set(last_checkpoint).await?;

            if fetched < bulk_size || only_checkpoints {
                break;
            }
        }

        if !had_conflicts {
            inner.mark_first_sync(Direction::Up);
            return Ok(());
        }

        debug!(
            direction = %Direction::Up,
            checkpoint_key = %inner.key,
            pending = unresolved.len(),
            "conflicts hit, waiting for downstream before the next round"
        );
        inner.down_queue.schedule();
        inner.until_cancelled(inner.down_queue.wait_drained()).await?;
    }
}

/// Returns true if a fork state still has to be pushed.
fn needs_push(key: &CheckpointKey, fork: &DocumentState) -> bool {
    let known = meta::last_known_master_state(fork, key).map(|m| &m.revision);
    known != Some(&fork.revision) && meta::post_upstream_marker(fork, key) != Some(&fork.revision)
}

async fn push_batch<M, F>(
    inner: &Inner<M, F>,
    fork_documents: Vec<DocumentState>,
) -> ReplicationResult<BatchOutcome>
where
    M: StorageInstance,
    F: StorageInstance,
{
    let key = &inner.key;
    let mut outcome = BatchOutcome::default();

    let forks: BTreeMap<String, DocumentState> = fork_documents
        .into_iter()
        .filter(|f| !inner.is_checkpoint_document(&f.primary_key))
        .filter(|f| needs_push(key, f))
        .map(|f| (f.primary_key.clone(), f))
        .collect();
    if forks.is_empty() {
        return Ok(outcome);
    }

    if let Some(hook) = &inner.wait_before_persist {
        inner.until_cancelled(hook()).await?;
    }
    inner.ensure_active()?;

    let rows = forks
        .values()
        .map(|f| WriteRow {
            previous: meta::last_known_master_state(f, key).cloned(),
            document: master_copy_of_fork(key, f),
        })
        .collect();
    let response = inner.master.bulk_write(rows).await?;

    let mut accepted: BTreeMap<String, DocumentState> = response.success;
    // Fork-side states of resolutions, echoed once master accepts them.
    let mut resolutions: BTreeMap<String, DocumentState> = BTreeMap::new();
    let mut fork_rows: Vec<WriteRow> = Vec::new();
    let mut retry_rows: Vec<WriteRow> = Vec::new();

    for (primary_key, error) in response.error {
        if let WriteErrorKind::Other(message) = error.kind {
            return Err(ReplicationError::write_rejected(
                Direction::Up,
                primary_key,
                message,
            ));
        }
        let Some(fork_doc) = forks.get(&primary_key) else {
            continue;
        };
        let pushed = error.write_row.document;
        let Some(master_doc) = error.document_in_db else {
            retry_rows.push(WriteRow::insert(pushed));
            continue;
        };
        if master_doc.revision == pushed.revision {
            // Someone else already pushed this exact state.
            accepted.insert(primary_key, master_doc);
            continue;
        }

        outcome.had_conflicts = true;
        let input = ConflictInput::new(
            meta::last_known_master_state(fork_doc, key),
            &master_doc,
            fork_doc,
        );
        match inner.resolve_conflict(Direction::Up, input) {
            ConflictOutput::AlreadyEqual => {
                let adopted = fork_copy_of_master(key, &master_doc, Some(fork_doc));
                fork_rows.push(WriteRow::update(fork_doc.clone(), adopted));
            }
            ConflictOutput::Resolved(resolved) => {
                let mut doc =
                    resolved_state(&inner.hash_function, resolved, &master_doc, &master_doc, fork_doc)?;
                let revision = doc.revision.clone();
                meta::clear_flags(&mut doc, key);
                meta::set_origin_is_fork(&mut doc, key, revision);
                resolutions.insert(primary_key, doc.clone());
                retry_rows.push(WriteRow::update(master_doc, doc));
            }
        }
    }

    if !retry_rows.is_empty() {
        let response = inner.master.bulk_write(retry_rows).await?;
        accepted.extend(response.success);
        for (primary_key, error) in response.error {
            if let WriteErrorKind::Other(message) = error.kind {
                return Err(ReplicationError::write_rejected(
                    Direction::Up,
                    primary_key,
                    message,
                ));
            }
            match error.document_in_db {
                Some(stored) if stored.revision == error.write_row.document.revision => {
                    accepted.insert(primary_key, stored);
                }
                _ => {
                    warn!(
                        direction = %Direction::Up,
                        primary_key = %primary_key,
                        "master changed during conflict resolution, retrying"
                    );
                    resolutions.remove(&primary_key);
                    outcome.had_conflicts = true;
                    outcome.unresolved.push(primary_key);
                }
            }
        }
    }

    for (primary_key, master_doc) in &accepted {
        let Some(fork_doc) = forks.get(primary_key) else {
            continue;
        };
        let mut echo = match resolutions.remove(primary_key) {
            Some(mut resolved) => {
                resolved.meta.replication = fork_doc.meta.replication.clone();
                resolved
            }
            None => fork_doc.clone(),
        };
        *meta::flags_mut(&mut echo, key) = ReplicationFlags {
            last_known_master_state: Some(Box::new(master_doc.without_replication_flags())),
            origin_is_fork: None,
            post_upstream_marker: Some(master_doc.revision.clone()),
        };
        fork_rows.push(WriteRow::update(fork_doc.clone(), echo));
    }

    if !fork_rows.is_empty() {
        let response = inner.fork.bulk_write(fork_rows).await?;
        let mut refresh = Vec::new();
        for (primary_key, error) in response.error {
            if let WriteErrorKind::Other(message) = error.kind {
                return Err(ReplicationError::write_rejected(
                    Direction::Up,
                    primary_key,
                    message,
                ));
            }
            // Fork moved on. Keep its newer state but record what master
            // accepted, so the next push does not conflict with ourselves.
            if let (Some(stored), Some(master_doc)) =
                (error.document_in_db, accepted.get(&primary_key))
            {
                refresh.extend(refresh_master_state(key, stored, master_doc));
            }
        }
        if !refresh.is_empty() {
            let response = inner.fork.bulk_write(refresh).await?;
            if !response.is_clean() {
                debug!(
                    direction = %Direction::Up,
                    count = response.error.len(),
                    "dropping echo rows, fork moved on again"
                );
            }
        }
    }

    inner
        .events
        .processed(Direction::Up, accepted.into_values().collect());
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkdb_storage::{Revision, StorageIdentity};
    use serde_json::Map;

    #[test]
    fn needs_push_skips_replicated_states() {
        let key = CheckpointKey::derive(
            "t",
            &StorageIdentity::new("memory", "m", "c"),
            &StorageIdentity::new("memory", "f", "c"),
        );
        let local = DocumentState::new("a", Revision::new(1, "l"), Map::new());
        assert!(needs_push(&key, &local));

        let from_master = fork_copy_of_master(&key, &local, None);
        assert!(!needs_push(&key, &from_master));

        let mut echoed = local.clone();
        meta::set_post_upstream_marker(&mut echoed, &key, local.revision.clone());
        assert!(!needs_push(&key, &echoed));

        let mut edited = echoed.clone();
        edited.revision = Revision::new(2, "e");
        assert!(needs_push(&key, &edited));
    }
}
