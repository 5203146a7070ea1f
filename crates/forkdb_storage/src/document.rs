//! Document data model.
//!
//! A [`DocumentState`] is an immutable snapshot of one document as stored by
//! a storage instance. Every write produces a new state with a new
//! [`Revision`]; states are never mutated in place by the storage.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A document revision of the form `<height>-<hash>`.
///
/// The height grows by one per write measured from the previous state.
/// The hash is a content digest, so two states at the same height with
/// different content have different revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    height: u64,
    hash: String,
}

impl Revision {
    /// Creates a revision from its parts.
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// Returns the revision height.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Returns the content hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl FromStr for Revision {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, hash) = s
            .split_once('-')
            .ok_or_else(|| StorageError::InvalidRevision(s.to_string()))?;
        let height = height
            .parse::<u64>()
            .map_err(|_| StorageError::InvalidRevision(s.to_string()))?;
        if height == 0 || hash.is_empty() {
            return Err(StorageError::InvalidRevision(s.to_string()));
        }
        Ok(Self::new(height, hash))
    }
}

impl TryFrom<String> for Revision {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(revision: Revision) -> Self {
        revision.to_string()
    }
}

/// Replication bookkeeping stored inside a document's metadata envelope.
///
/// One instance exists per replication (keyed by its checkpoint key in
/// [`DocumentMeta::replication`]), so several replications can share a store
/// without seeing each other's markers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFlags {
    /// Master state assumed current when the fork copy was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_master_state: Option<Box<DocumentState>>,
    /// Fork revision that produced this master copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_is_fork: Option<Revision>,
    /// Revision the fork believes master accepted in the last upstream push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_upstream_marker: Option<Revision>,
}

impl ReplicationFlags {
    /// Returns true if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.last_known_master_state.is_none()
            && self.origin_is_fork.is_none()
            && self.post_upstream_marker.is_none()
    }
}

/// The metadata envelope of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Last write time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub lwt: u64,
    /// Replication flags keyed by checkpoint key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replication: BTreeMap<String, ReplicationFlags>,
}

impl DocumentMeta {
    /// Creates metadata with the given last write time and no flags.
    pub fn with_lwt(lwt: u64) -> Self {
        Self {
            lwt,
            replication: BTreeMap::new(),
        }
    }
}

/// A stored document state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    /// Primary key.
    pub primary_key: String,
    /// Revision of this state.
    pub revision: Revision,
    /// Whether this state is a deletion tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Metadata envelope.
    #[serde(default)]
    pub meta: DocumentMeta,
    /// User fields.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl DocumentState {
    /// Creates a live document state with empty metadata.
    pub fn new(primary_key: impl Into<String>, revision: Revision, data: Map<String, Value>) -> Self {
        Self {
            primary_key: primary_key.into(),
            revision,
            deleted: false,
            meta: DocumentMeta::default(),
            data,
        }
    }

    /// Returns true if both states carry the same user-visible content.
    ///
    /// Revision and metadata are ignored.
    pub fn same_content(&self, other: &DocumentState) -> bool {
        self.primary_key == other.primary_key
            && self.deleted == other.deleted
            && self.data == other.data
    }

    /// Returns a copy with every replication flag removed.
    ///
    /// This is the view handed to conflict handlers and application reads.
    pub fn without_replication_flags(&self) -> DocumentState {
        let mut doc = self.clone();
        doc.meta.replication.clear();
        doc
    }

    /// Returns the value of a user field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn revision_display_and_parse() {
        let rev = Revision::new(3, "abcdef");
        assert_eq!(rev.to_string(), "3-abcdef");
        assert_eq!("3-abcdef".parse::<Revision>().unwrap(), rev);
    }

    #[test]
    fn revision_rejects_malformed() {
        assert!("abcdef".parse::<Revision>().is_err());
        assert!("x-abcdef".parse::<Revision>().is_err());
        assert!("0-abcdef".parse::<Revision>().is_err());
        assert!("4-".parse::<Revision>().is_err());
    }

    #[test]
    fn revision_serializes_as_string() {
        let rev = Revision::new(12, "ff00");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"12-ff00\"");
        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
    }

    #[test]
    fn same_content_ignores_meta_and_revision() {
        let a = DocumentState::new("a", Revision::new(1, "x"), data(json!({"value": 1})));
        let mut b = a.clone();
        b.revision = Revision::new(2, "y");
        b.meta.lwt = 99;
        assert!(a.same_content(&b));

        b.data.insert("value".into(), json!(2));
        assert!(!a.same_content(&b));

        let mut c = a.clone();
        c.deleted = true;
        assert!(!a.same_content(&c));
    }

    #[test]
    fn without_replication_flags_keeps_lwt() {
        let mut doc = DocumentState::new("a", Revision::new(1, "x"), Map::new());
        doc.meta.lwt = 42;
        doc.meta.replication.insert(
            "key".into(),
            ReplicationFlags {
                origin_is_fork: Some(Revision::new(1, "x")),
                ..Default::default()
            },
        );

        let stripped = doc.without_replication_flags();
        assert!(stripped.meta.replication.is_empty());
        assert_eq!(stripped.meta.lwt, 42);
        assert_eq!(doc.meta.replication.len(), 1);
    }

    #[test]
    fn empty_flags_are_not_serialized() {
        let doc = DocumentState::new("a", Revision::new(1, "x"), data(json!({"v": true})));
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["meta"].get("replication").is_none());
    }
}
