//! Replication identity: checkpoint keys and directions.

use crate::error::ProtocolError;
use crate::revision::sha256_hex;
use forkdb_storage::StorageIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fork to master.
    Up,
    /// Master to fork.
    Down,
}

impl Direction {
    /// Both directions.
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// Returns the other direction.
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(ProtocolError::InvalidDirection(other.to_string())),
        }
    }
}

/// Key identifying one master/fork replication.
///
/// It names the replication's flags inside document metadata and the
/// checkpoint documents of both directions. The key is derived from the
/// replication identifier and the identities of both storages, so restarting
/// the same replication resumes from its persisted checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    /// Prefix of every derived key.
    pub const PREFIX: &'static str = "replication-";

    /// Derives the key for a replication.
    pub fn derive(identifier: &str, master: &StorageIdentity, fork: &StorageIdentity) -> Self {
        let joined = [
            identifier,
            &master.storage_name,
            &master.database_name,
            &master.collection_name,
            &fork.storage_name,
            &fork.database_name,
            &fork.collection_name,
        ]
        .join("||");
        Self(format!("{}{}", Self::PREFIX, sha256_hex(joined.as_bytes())))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the primary key of the checkpoint document for `direction`.
    pub fn document_id(&self, direction: Direction) -> String {
        format!("{}-{}", self.0, direction)
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CheckpointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (StorageIdentity, StorageIdentity) {
        (
            StorageIdentity::new("memory", "remote", "todos"),
            StorageIdentity::new("memory", "local", "todos"),
        )
    }

    #[test]
    fn direction_names() {
        assert_eq!(Direction::Up.to_string(), "up");
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Down);
        assert!("left".parse::<Direction>().is_err());
        assert_eq!(Direction::Up.opposite(), Direction::Down);
    }

    #[test]
    fn key_is_deterministic() {
        let (master, fork) = ids();
        let a = CheckpointKey::derive("sync", &master, &fork);
        let b = CheckpointKey::derive("sync", &master, &fork);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with(CheckpointKey::PREFIX));
        assert_eq!(a.as_str().len(), CheckpointKey::PREFIX.len() + 64);
    }

    #[test]
    fn key_depends_on_every_input() {
        let (master, fork) = ids();
        let base = CheckpointKey::derive("sync", &master, &fork);
        assert_ne!(base, CheckpointKey::derive("other", &master, &fork));
        assert_ne!(base, CheckpointKey::derive("sync", &fork, &master));

        let renamed = StorageIdentity::new("memory", "remote", "notes");
        assert_ne!(base, CheckpointKey::derive("sync", &renamed, &fork));
    }

    #[test]
    fn document_ids_per_direction() {
        let (master, fork) = ids();
        let key = CheckpointKey::derive("sync", &master, &fork);
        assert_eq!(key.document_id(Direction::Up), format!("{key}-up"));
        assert_ne!(key.document_id(Direction::Up), key.document_id(Direction::Down));
    }
}
