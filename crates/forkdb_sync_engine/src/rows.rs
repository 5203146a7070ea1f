//! Construction of the documents written by the replication loops.

use crate::error::ReplicationResult;
use forkdb_storage::{DocumentState, ReplicationFlags, WriteRow};
use forkdb_sync_protocol::meta;
use forkdb_sync_protocol::{lwt_now, resolution_revision, CheckpointKey, HashFunction};

/// Returns the fork copy of a master state.
///
/// The copy carries the master content and revision. Flags of other
/// replications are taken from the current fork document; this replication's
/// flags only record `master` as the last known master state.
pub(crate) fn fork_copy_of_master(
    key: &CheckpointKey,
    master: &DocumentState,
    current_fork: Option<&DocumentState>,
) -> DocumentState {
    let mut doc = master.without_replication_flags();
    if let Some(fork) = current_fork {
        doc.meta.replication = fork.meta.replication.clone();
    }
    *meta::flags_mut(&mut doc, key) = ReplicationFlags {
        last_known_master_state: Some(Box::new(master.without_replication_flags())),
        ..Default::default()
    };
    doc
}

/// Returns the master copy of a fork state, marked as originating from it.
pub(crate) fn master_copy_of_fork(key: &CheckpointKey, fork: &DocumentState) -> DocumentState {
    let mut doc = fork.without_replication_flags();
    meta::set_origin_is_fork(&mut doc, key, fork.revision.clone());
    doc
}

/// Turns a conflict handler's output into a storable state.
///
/// Primary key and metadata come from `conflicting`, `lwt` is refreshed and
/// the revision chains from the higher of `a` and `b`.
///
/// The parent is the higher conflicting revision even when that is the fork
/// state, never unconditionally the master state, so the result is above
/// both sides and neither side drops it as an older write.
pub(crate) fn resolved_state(
    hash_function: &HashFunction,
    resolved: DocumentState,
    conflicting: &DocumentState,
    a: &DocumentState,
    b: &DocumentState,
) -> ReplicationResult<DocumentState> {
    let mut doc = resolved;
    doc.primary_key = conflicting.primary_key.clone();
    doc.meta = conflicting.meta.clone();
    doc.meta.lwt = lwt_now();
    doc.revision = resolution_revision(hash_function, &doc, &a.revision, &b.revision)?;
    Ok(doc)
}

/// Builds a row that records `master` as the last known master state of a
/// fork document that moved on since an upstream push.
///
/// Returns `None` when the stored document already knows the same or a newer
/// master state.
pub(crate) fn refresh_master_state(
    key: &CheckpointKey,
    stored: DocumentState,
    master: &DocumentState,
) -> Option<WriteRow> {
    if meta::is_in_sync_with_master(&stored, key) {
        return None;
    }
    if meta::last_known_master_state(&stored, key)
        .is_some_and(|known| known.revision.height() >= master.revision.height())
    {
        return None;
    }
    let mut doc = stored.clone();
    meta::set_last_known_master_state(&mut doc, key, master);
    if doc.revision == master.revision {
        meta::set_post_upstream_marker(&mut doc, key, master.revision.clone());
    }
    Some(WriteRow::update(stored, doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkdb_storage::{Revision, StorageIdentity};
    use forkdb_sync_protocol::default_hash_function;
    use serde_json::{json, Map, Value};

    fn key(id: &str) -> CheckpointKey {
        CheckpointKey::derive(
            id,
            &StorageIdentity::new("memory", "m", "c"),
            &StorageIdentity::new("memory", "f", "c"),
        )
    }

    fn doc(rev: &str, value: i64) -> DocumentState {
        let mut data = Map::new();
        data.insert("value".into(), Value::from(value));
        DocumentState::new("a", rev.parse().unwrap(), data)
    }

    #[test]
    fn fork_copy_keeps_foreign_flags() {
        let (ours, theirs) = (key("ours"), key("theirs"));
        let mut fork = doc("1-f", 1);
        meta::set_post_upstream_marker(&mut fork, &ours, Revision::new(1, "f"));
        meta::set_post_upstream_marker(&mut fork, &theirs, Revision::new(1, "f"));

        let mut master = doc("2-m", 2);
        meta::set_origin_is_fork(&mut master, &theirs, Revision::new(9, "x"));

        let copy = fork_copy_of_master(&ours, &master, Some(&fork));
        assert_eq!(copy.revision, master.revision);
        assert_eq!(copy.get("value"), Some(&json!(2)));
        assert!(meta::is_in_sync_with_master(&copy, &ours));
        assert!(meta::post_upstream_marker(&copy, &ours).is_none());
        // Foreign flags come from the fork document, not from master.
        assert!(meta::post_upstream_marker(&copy, &theirs).is_some());
        assert!(meta::origin_is_fork(&copy, &theirs).is_none());
    }

    #[test]
    fn master_copy_is_marked_with_origin() {
        let k = key("ours");
        let mut fork = doc("3-f", 3);
        meta::set_last_known_master_state(&mut fork, &k, &doc("2-m", 2));
        let copy = master_copy_of_fork(&k, &fork);
        assert_eq!(copy.revision, fork.revision);
        assert_eq!(meta::origin_is_fork(&copy, &k), Some(&fork.revision));
        assert!(meta::last_known_master_state(&copy, &k).is_none());
    }

    #[test]
    fn resolved_state_is_above_both_inputs() {
        let hash_function = default_hash_function();
        let master = doc("4-m", 1);
        let fork = doc("2-f", 2);
        let resolved = resolved_state(&hash_function, doc("1-x", 3), &fork, &master, &fork).unwrap();
        assert_eq!(resolved.revision.height(), 5);
        assert_eq!(resolved.get("value"), Some(&json!(3)));

        // Argument order does not change the revision.
        let again = resolved_state(&hash_function, doc("1-x", 3), &master, &fork, &master).unwrap();
        assert_eq!(again.revision, resolved.revision);
    }

    #[test]
    fn refresh_skips_documents_with_newer_knowledge() {
        let k = key("ours");
        let pushed = doc("2-p", 2);

        let mut newer_local = doc("3-l", 3);
        meta::set_last_known_master_state(&mut newer_local, &k, &doc("1-m", 1));
        let row = refresh_master_state(&k, newer_local, &pushed).unwrap();
        assert_eq!(
            meta::last_known_master_state(&row.document, &k).unwrap().revision,
            pushed.revision
        );
        assert!(meta::post_upstream_marker(&row.document, &k).is_none());

        let mut ahead = doc("5-l", 5);
        meta::set_last_known_master_state(&mut ahead, &k, &doc("4-m", 4));
        assert!(refresh_master_state(&k, ahead, &pushed).is_none());

        let in_sync = fork_copy_of_master(&k, &doc("3-m", 3), None);
        assert!(refresh_master_state(&k, in_sync, &pushed).is_none());
    }
}
