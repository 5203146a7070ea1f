//! Revision computation.
//!
//! A revision hash covers the primary key, the deletion flag and the user
//! data of a document. Revision and metadata never enter the digest, so
//! stamping replication flags on a document does not change its hash.

use crate::error::ProtocolResult;
use forkdb_storage::{DocumentState, Revision};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A content hash function: bytes in, printable digest out.
pub type HashFunction = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Returns the default hash function (SHA-256, lowercase hex).
pub fn default_hash_function() -> HashFunction {
    Arc::new(sha256_hex)
}

/// Computes the lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Serialize)]
struct HashedContent<'a> {
    primary_key: &'a str,
    deleted: bool,
    data: &'a Map<String, Value>,
}

/// Returns the stable serialization of a document's hashed content.
///
/// Object keys are emitted in sorted order, so equal content always yields
/// equal bytes.
pub fn stable_content_bytes(doc: &DocumentState) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(&HashedContent {
        primary_key: &doc.primary_key,
        deleted: doc.deleted,
        data: &doc.data,
    })?)
}

/// Hashes the content of `doc` with `hash_fn`.
pub fn content_hash(hash_fn: &HashFunction, doc: &DocumentState) -> ProtocolResult<String> {
    Ok(hash_fn(&stable_content_bytes(doc)?))
}

/// Computes the revision of `doc` written on top of `previous`.
///
/// The height is one above `previous` (or 1 for a first write).
pub fn next_revision(
    hash_fn: &HashFunction,
    doc: &DocumentState,
    previous: Option<&Revision>,
) -> ProtocolResult<Revision> {
    let height = previous.map_or(0, Revision::height) + 1;
    Ok(Revision::new(height, content_hash(hash_fn, doc)?))
}

/// Computes the revision of a conflict resolution.
///
/// The result chains from the higher of both conflicting revisions, so it is
/// strictly higher than each of them. It depends only on the inputs, so both
/// replication directions assign the same revision to the same resolution.
pub fn resolution_revision(
    hash_fn: &HashFunction,
    resolved: &DocumentState,
    a: &Revision,
    b: &Revision,
) -> ProtocolResult<Revision> {
    let base = if a.height() >= b.height() { a } else { b };
    next_revision(hash_fn, resolved, Some(base))
}

static LAST_LWT: AtomicU64 = AtomicU64::new(0);

/// Returns the current time in milliseconds, strictly increasing per process.
///
/// Two calls in the same millisecond return consecutive values.
pub fn lwt_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    let mut last = LAST_LWT.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_LWT.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(data: Value) -> DocumentState {
        DocumentState::new(
            "a",
            Revision::new(1, "placeholder"),
            data.as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn first_write_has_height_one() {
        let hash_fn = default_hash_function();
        let rev = next_revision(&hash_fn, &doc(json!({"v": 1})), None).unwrap();
        assert_eq!(rev.height(), 1);
        assert_eq!(rev.hash().len(), 64);
    }

    #[test]
    fn hash_ignores_meta_and_revision() {
        let hash_fn = default_hash_function();
        let a = doc(json!({"v": 1}));
        let mut b = a.clone();
        b.revision = Revision::new(7, "other");
        b.meta.lwt = 123;
        b.meta.replication.insert("k".into(), Default::default());
        assert_eq!(
            content_hash(&hash_fn, &a).unwrap(),
            content_hash(&hash_fn, &b).unwrap()
        );
    }

    #[test]
    fn hash_covers_deleted_flag() {
        let hash_fn = default_hash_function();
        let a = doc(json!({"v": 1}));
        let mut b = a.clone();
        b.deleted = true;
        assert_ne!(
            content_hash(&hash_fn, &a).unwrap(),
            content_hash(&hash_fn, &b).unwrap()
        );
    }

    #[test]
    fn custom_hash_function_is_used() {
        let hash_fn: HashFunction = Arc::new(|bytes: &[u8]| format!("len{}", bytes.len()));
        let rev = next_revision(&hash_fn, &doc(json!({})), Some(&Revision::new(4, "x"))).unwrap();
        assert_eq!(rev.height(), 5);
        assert!(rev.hash().starts_with("len"));
    }

    #[test]
    fn resolution_chains_from_higher_revision() {
        let hash_fn = default_hash_function();
        let resolved = doc(json!({"v": 3}));
        let low = Revision::new(2, "a");
        let high = Revision::new(5, "b");
        let r1 = resolution_revision(&hash_fn, &resolved, &low, &high).unwrap();
        let r2 = resolution_revision(&hash_fn, &resolved, &high, &low).unwrap();
        assert_eq!(r1.height(), 6);
        assert_eq!(r1, r2);
    }

    #[test]
    fn lwt_is_strictly_increasing() {
        let mut last = lwt_now();
        for _ in 0..1000 {
            let next = lwt_now();
            assert!(next > last);
            last = next;
        }
    }

    proptest! {
        #[test]
        fn hash_is_key_order_independent(pairs in prop::collection::vec(("[a-z]{1,6}", any::<i32>()), 0..8)) {
            let hash_fn = default_hash_function();
            let mut forward = Map::new();
            for (k, v) in &pairs {
                forward.insert(k.clone(), json!(v));
            }
            let mut backward = Map::new();
            for (k, v) in pairs.iter().rev() {
                if !backward.contains_key(k) {
                    backward.insert(k.clone(), forward[k].clone());
                }
            }
            let a = DocumentState::new("k", Revision::new(1, "x"), forward);
            let b = DocumentState::new("k", Revision::new(1, "x"), backward);
            prop_assert_eq!(content_hash(&hash_fn, &a).unwrap(), content_hash(&hash_fn, &b).unwrap());
        }

        #[test]
        fn different_values_hash_differently(x in any::<i64>(), y in any::<i64>()) {
            prop_assume!(x != y);
            let hash_fn = default_hash_function();
            let a = doc(json!({"v": x}));
            let b = doc(json!({"v": y}));
            prop_assert_ne!(content_hash(&hash_fn, &a).unwrap(), content_hash(&hash_fn, &b).unwrap());
        }

        #[test]
        fn height_increments_by_one(height in 1u64..u64::MAX / 2) {
            let hash_fn = default_hash_function();
            let rev = next_revision(&hash_fn, &doc(json!({})), Some(&Revision::new(height, "p"))).unwrap();
            prop_assert_eq!(rev.height(), height + 1);
        }
    }
}
