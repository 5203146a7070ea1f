//! # forkdb Sync Protocol
//!
//! Replication protocol types for forkdb.
//!
//! This crate provides:
//! - Revision computation (`next_revision`, `HashFunction`)
//! - Replication flags stored in document metadata
//! - `CheckpointKey` derivation and `Direction`
//! - The conflict resolution contract (`ConflictHandler`)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod conflict;
mod error;
pub mod meta;
mod revision;

pub use checkpoint::{CheckpointKey, Direction};
pub use conflict::{ConflictHandler, ConflictInput, ConflictOutput, ConflictPolicy, ResolvedConflict};
pub use error::{ProtocolError, ProtocolResult};
pub use revision::{
    content_hash, default_hash_function, lwt_now, next_revision, resolution_revision,
    sha256_hex, stable_content_bytes, HashFunction,
};
