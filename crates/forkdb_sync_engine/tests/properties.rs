//! Property tests for master/fork replication.

use forkdb_storage::{DocumentStore, InMemoryStorage};
use forkdb_sync_engine::{replicate, ReplicationConfig, ReplicationInput};
use forkdb_testkit::{
    delete_local, fields, local_write_sequence_strategy, paired_storages, write_local, LocalWrite,
    PropTestConfig,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;

async fn apply<S>(store: &S, prefix: &str, writes: &[LocalWrite])
where
    S: DocumentStore + ?Sized,
{
    for write in writes {
        let primary_key = format!("{prefix}{}", write.key());
        match write {
            LocalWrite::Put { data, .. } => {
                write_local(store, &primary_key, data.clone()).await.unwrap();
            }
            LocalWrite::Delete { .. } => {
                delete_local(store, &primary_key).await.unwrap();
            }
        }
        // Lets running loops interleave with the writes.
        tokio::task::yield_now().await;
    }
}

/// Final state per primary key: `None` for deleted documents.
fn expected(prefix: &str, writes: &[LocalWrite]) -> BTreeMap<String, Option<LocalWrite>> {
    writes
        .iter()
        .map(|write| {
            let state = match write {
                LocalWrite::Put { .. } => Some(write.clone()),
                LocalWrite::Delete { .. } => None,
            };
            (format!("{prefix}{}", write.key()), state)
        })
        .collect()
}

fn check_side(
    store: &InMemoryStorage,
    expected: &BTreeMap<String, Option<LocalWrite>>,
) -> Result<(), TestCaseError> {
    for (primary_key, state) in expected {
        let doc = store.get(primary_key);
        prop_assert!(doc.is_some(), "{} is missing", primary_key);
        let doc = doc.unwrap();
        match state {
            Some(LocalWrite::Put { data, .. }) => {
                prop_assert!(!doc.deleted, "{} is deleted", primary_key);
                prop_assert_eq!(&doc.data, &fields(data.clone()));
            }
            _ => prop_assert!(doc.deleted, "{} is live", primary_key),
        }
    }
    Ok(())
}

fn converged(master: &InMemoryStorage, fork: &InMemoryStorage) -> Result<(), TestCaseError> {
    let master_docs = master.documents();
    let fork_docs = fork.documents();
    prop_assert_eq!(master_docs.len(), fork_docs.len());
    for (m, f) in master_docs.iter().zip(&fork_docs) {
        prop_assert_eq!(&m.primary_key, &f.primary_key);
        prop_assert_eq!(&m.revision, &f.revision);
        prop_assert!(m.same_content(f), "content of {}", m.primary_key);
    }
    Ok(())
}

async fn replicate_writes(
    master_writes: Vec<LocalWrite>,
    fork_writes: Vec<LocalWrite>,
    live_from: usize,
    bulk_size: usize,
) -> Result<(), TestCaseError> {
    let (master, fork) = paired_storages();
    let (master_before, master_live) = master_writes.split_at(live_from.min(master_writes.len()));
    let (fork_before, fork_live) = fork_writes.split_at(live_from.min(fork_writes.len()));

    apply(master.as_ref(), "m-", master_before).await;
    apply(fork.as_ref(), "f-", fork_before).await;

    let state = replicate(ReplicationInput::new(
        ReplicationConfig::new("props").with_bulk_size(bulk_size),
        master.clone(),
        fork.clone(),
    ));
    apply(master.as_ref(), "m-", master_live).await;
    apply(fork.as_ref(), "f-", fork_live).await;

    let idle = timeout(Duration::from_secs(10), state.await_idle()).await;
    prop_assert!(idle.is_ok(), "replication did not become idle");
    prop_assert!(idle.unwrap().is_ok(), "replication failed");

    converged(&master, &fork)?;
    let from_master = expected("m-", &master_writes);
    let from_fork = expected("f-", &fork_writes);
    check_side(&fork, &from_master)?;
    check_side(&master, &from_fork)?;
    prop_assert_eq!(master.len(), from_master.len() + from_fork.len());
    prop_assert_eq!(state.stats().conflicts_resolved(), 0);

    state.cancel().await;
    Ok(())
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn disjoint_writes_converge(
        master_writes in local_write_sequence_strategy(0, 12),
        fork_writes in local_write_sequence_strategy(0, 12),
        live_from in 0usize..12,
        bulk_size in 1usize..5,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(replicate_writes(master_writes, fork_writes, live_from, bulk_size))?;
    }
}
