//! Property-based test generators using proptest.
//!
//! Provides strategies for document fields, revisions and sequences of
//! application writes.

use forkdb_storage::{DocumentState, Revision};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating primary keys from a small alphabet, so that
/// generated writes collide often.
pub fn primary_key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e"]).prop_map(str::to_string)
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

/// Strategy for generating document fields (nested one level).
pub fn fields_strategy() -> impl Strategy<Value = Map<String, Value>> {
    let value = prop_oneof![
        3 => scalar_strategy(),
        1 => prop::collection::vec(scalar_strategy(), 0..4).prop_map(Value::from),
        1 => prop::collection::btree_map("[a-z]{1,6}", scalar_strategy(), 0..4)
            .prop_map(|m| Value::Object(m.into_iter().collect())),
    ];
    prop::collection::btree_map("[a-z]{1,8}", value, 0..6).prop_map(|m| m.into_iter().collect())
}

/// Strategy for generating revisions.
pub fn revision_strategy() -> impl Strategy<Value = Revision> {
    (1u64..1000, "[0-9a-f]{8}").prop_map(|(height, hash)| Revision::new(height, hash))
}

/// Strategy for generating live document states.
pub fn document_strategy() -> impl Strategy<Value = DocumentState> {
    (primary_key_strategy(), revision_strategy(), fields_strategy())
        .prop_map(|(key, revision, data)| DocumentState::new(key, revision, data))
}

/// An application write.
#[derive(Debug, Clone)]
pub enum LocalWrite {
    /// Insert or update a document.
    Put {
        /// Primary key.
        key: String,
        /// New fields.
        data: Value,
    },
    /// Delete a document.
    Delete {
        /// Primary key.
        key: String,
    },
}

impl LocalWrite {
    /// Returns the primary key written.
    pub fn key(&self) -> &str {
        match self {
            LocalWrite::Put { key, .. } | LocalWrite::Delete { key } => key,
        }
    }
}

/// Strategy for generating application writes.
pub fn local_write_strategy() -> impl Strategy<Value = LocalWrite> {
    prop_oneof![
        4 => (primary_key_strategy(), fields_strategy())
            .prop_map(|(key, data)| LocalWrite::Put { key, data: Value::Object(data) }),
        1 => primary_key_strategy().prop_map(|key| LocalWrite::Delete { key }),
    ]
}

/// Strategy for generating a sequence of application writes.
pub fn local_write_sequence_strategy(
    min_writes: usize,
    max_writes: usize,
) -> impl Strategy<Value = Vec<LocalWrite>> {
    prop::collection::vec(local_write_strategy(), min_writes..max_writes)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn revisions_round_trip_through_strings(revision in revision_strategy()) {
            let parsed: Revision = revision.to_string().parse().unwrap();
            prop_assert_eq!(parsed, revision);
        }

        #[test]
        fn writes_use_known_keys(writes in local_write_sequence_strategy(1, 8)) {
            prop_assert!(!writes.is_empty());
            for write in &writes {
                prop_assert!(["a", "b", "c", "d", "e"].contains(&write.key()));
            }
        }

        #[test]
        fn generated_documents_are_live(doc in document_strategy()) {
            prop_assert!(!doc.deleted);
            prop_assert!(doc.revision.height() >= 1);
        }
    }
}
