//! # forkdb Storage
//!
//! Document storage contract and an in-memory implementation.
//!
//! A storage instance holds versioned documents and supports three things
//! replication depends on:
//!
//! - bulk writes with optimistic concurrency: each row names the state it
//!   expects to replace, and mismatching rows are rejected as conflicts
//!   carrying the stored document
//! - ordered change enumeration after an opaque checkpoint
//! - a change stream announcing accepted writes
//!
//! ## Available Instances
//!
//! - [`InMemoryStorage`] - For tests and ephemeral data

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod change_feed;
mod document;
mod error;
mod memory;

pub use backend::{
    BulkWriteResponse, ChangedDocument, CheckpointValue, DocumentStore, StorageIdentity,
    StorageInstance, WriteError, WriteErrorKind, WriteRow,
};
pub use change_feed::{ChangeEvent, ChangeOperation, DocumentChange, EventBulk};
pub use document::{DocumentMeta, DocumentState, ReplicationFlags, Revision};
pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryStorage, DEFAULT_CHANGE_STREAM_CAPACITY};
