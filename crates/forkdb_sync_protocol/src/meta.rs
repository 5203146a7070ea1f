//! Replication flags stored in document metadata.
//!
//! Each replication owns one [`ReplicationFlags`] entry, keyed by its
//! [`CheckpointKey`]. Setting a flag never touches the revision or `lwt`.

use crate::checkpoint::CheckpointKey;
use forkdb_storage::{DocumentState, ReplicationFlags, Revision};

/// Returns the flags of replication `key`, if any.
pub fn read_flags<'a>(doc: &'a DocumentState, key: &CheckpointKey) -> Option<&'a ReplicationFlags> {
    doc.meta.replication.get(key.as_str())
}

/// Returns the flags of replication `key`, creating an empty entry if needed.
pub fn flags_mut<'a>(doc: &'a mut DocumentState, key: &CheckpointKey) -> &'a mut ReplicationFlags {
    doc.meta
        .replication
        .entry(key.as_str().to_string())
        .or_default()
}

/// Returns the last known master state recorded on a fork document.
pub fn last_known_master_state<'a>(
    doc: &'a DocumentState,
    key: &CheckpointKey,
) -> Option<&'a DocumentState> {
    read_flags(doc, key).and_then(|f| f.last_known_master_state.as_deref())
}

/// Returns the fork revision that produced a master document.
pub fn origin_is_fork<'a>(doc: &'a DocumentState, key: &CheckpointKey) -> Option<&'a Revision> {
    read_flags(doc, key).and_then(|f| f.origin_is_fork.as_ref())
}

/// Returns the revision master accepted in the last upstream push.
pub fn post_upstream_marker<'a>(
    doc: &'a DocumentState,
    key: &CheckpointKey,
) -> Option<&'a Revision> {
    read_flags(doc, key).and_then(|f| f.post_upstream_marker.as_ref())
}

/// Records `master` as the last known master state. The snapshot is stored
/// without its own replication flags.
pub fn set_last_known_master_state(
    doc: &mut DocumentState,
    key: &CheckpointKey,
    master: &DocumentState,
) {
    flags_mut(doc, key).last_known_master_state = Some(Box::new(master.without_replication_flags()));
}

/// Records the fork revision a master document was produced from.
pub fn set_origin_is_fork(doc: &mut DocumentState, key: &CheckpointKey, revision: Revision) {
    flags_mut(doc, key).origin_is_fork = Some(revision);
}

/// Records the revision master accepted in an upstream push.
pub fn set_post_upstream_marker(doc: &mut DocumentState, key: &CheckpointKey, revision: Revision) {
    flags_mut(doc, key).post_upstream_marker = Some(revision);
}

/// Removes the flags of replication `key`, leaving other replications' flags.
pub fn clear_flags(doc: &mut DocumentState, key: &CheckpointKey) {
    doc.meta.replication.remove(key.as_str());
}

/// Returns `doc` with every replication flag removed.
pub fn strip_replication_flags(mut doc: DocumentState) -> DocumentState {
    doc.meta.replication.clear();
    doc
}

/// Returns true if a fork document holds exactly its last known master state,
/// i.e. it carries no unreplicated local write.
pub fn is_in_sync_with_master(doc: &DocumentState, key: &CheckpointKey) -> bool {
    last_known_master_state(doc, key).is_some_and(|m| m.revision == doc.revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkdb_storage::StorageIdentity;
    use serde_json::Map;

    fn key(id: &str) -> CheckpointKey {
        CheckpointKey::derive(
            id,
            &StorageIdentity::new("memory", "m", "c"),
            &StorageIdentity::new("memory", "f", "c"),
        )
    }

    fn doc(height: u64) -> DocumentState {
        let mut doc = DocumentState::new("a", Revision::new(height, "h"), Map::new());
        doc.meta.lwt = 10;
        doc
    }

    #[test]
    fn setters_do_not_touch_revision_or_lwt() {
        let k = key("r");
        let mut d = doc(2);
        set_origin_is_fork(&mut d, &k, Revision::new(2, "h"));
        set_post_upstream_marker(&mut d, &k, Revision::new(3, "z"));
        assert_eq!(d.revision, Revision::new(2, "h"));
        assert_eq!(d.meta.lwt, 10);
        assert_eq!(origin_is_fork(&d, &k), Some(&Revision::new(2, "h")));
        assert_eq!(post_upstream_marker(&d, &k).unwrap().height(), 3);
    }

    #[test]
    fn last_known_master_state_is_stored_stripped() {
        let k = key("r");
        let mut master = doc(1);
        set_origin_is_fork(&mut master, &k, Revision::new(1, "h"));

        let mut fork = doc(1);
        set_last_known_master_state(&mut fork, &k, &master);
        let lkms = last_known_master_state(&fork, &k).unwrap();
        assert!(lkms.meta.replication.is_empty());
        assert!(is_in_sync_with_master(&fork, &k));

        fork.revision = Revision::new(2, "local");
        assert!(!is_in_sync_with_master(&fork, &k));
    }

    #[test]
    fn flags_are_isolated_per_key() {
        let (a, b) = (key("a"), key("b"));
        let mut d = doc(1);
        set_origin_is_fork(&mut d, &a, Revision::new(1, "h"));
        assert!(read_flags(&d, &b).is_none());

        set_origin_is_fork(&mut d, &b, Revision::new(1, "h"));
        clear_flags(&mut d, &a);
        assert!(read_flags(&d, &a).is_none());
        assert!(read_flags(&d, &b).is_some());

        let stripped = strip_replication_flags(d);
        assert!(stripped.meta.replication.is_empty());
    }

    #[test]
    fn missing_flags_are_not_in_sync() {
        assert!(!is_in_sync_with_master(&doc(1), &key("r")));
    }
}
