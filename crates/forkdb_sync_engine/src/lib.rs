//! # forkdb Sync Engine
//!
//! Master/fork replication between two forkdb storage instances.
//!
//! This crate provides:
//! - The downstream loop (master to fork) and the upstream loop (fork to master)
//! - Persisted, per-direction checkpoints
//! - Conflict resolution through a pluggable `ConflictHandler`
//! - Run queues that coalesce change notifications
//! - Observable state: first-sync flags, idle detection, event streams and stats
//!
//! ## Architecture
//!
//! Every replicated document carries per-replication flags in its metadata.
//! The fork remembers the last master state it saw (`last_known_master_state`),
//! master remembers which fork revision it was written from (`origin_is_fork`).
//! Both loops skip states the other loop produced, so writes never bounce back.
//!
//! ```text
//!            downstream (previous = fork state or branch state)
//!   master  ───────────────────────────────────────────────▶  fork
//!           ◀───────────────────────────────────────────────
//!            upstream (previous = last known master state)
//! ```
//!
//! ## Key Invariants
//!
//! - Master is authoritative; the fork converges to it
//! - Passes of one direction never overlap
//! - A checkpoint only advances after its batch was written
//! - Replication never writes a state back to the side it came from

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod downstream;
mod error;
mod events;
mod queue;
mod rows;
mod state;
mod upstream;

pub use config::{
    ReplicationConfig, DEFAULT_BULK_SIZE, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_PENDING_RUNS,
};
pub use error::{ReplicationError, ReplicationResult};
pub use events::{ConflictEvent, DirectionStats, PassError, ProcessedBatch, ReplicationStats};
pub use queue::QueueStatus;
pub use state::{replicate, PersistHook, ReplicationInput, ReplicationState};

pub use forkdb_sync_protocol::{ConflictHandler, ConflictInput, ConflictOutput, ConflictPolicy, Direction};
