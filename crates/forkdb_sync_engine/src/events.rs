//! Replication statistics and event streams.

use crate::error::ReplicationError;
use forkdb_storage::DocumentState;
use forkdb_sync_protocol::{Direction, ResolvedConflict};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// Statistics for one direction.
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    /// Passes completed successfully.
    pub passes: u64,
    /// Passes that failed.
    pub failed_passes: u64,
    /// Documents written to the destination.
    pub documents_written: u64,
    /// Conflicts handed to the conflict handler.
    pub conflicts_resolved: u64,
    /// Completion time of the last successful pass.
    pub last_pass: Option<Instant>,
}

/// Statistics about a replication.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Fork to master.
    pub up: DirectionStats,
    /// Master to fork.
    pub down: DirectionStats,
    /// Message of the last failed pass.
    pub last_error: Option<String>,
}

impl ReplicationStats {
    /// Returns the statistics of `direction`.
    pub fn direction(&self, direction: Direction) -> &DirectionStats {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionStats {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }

    /// Total conflicts resolved in both directions.
    pub fn conflicts_resolved(&self) -> u64 {
        self.up.conflicts_resolved + self.down.conflicts_resolved
    }
}

/// Documents written to the destination by one batch.
#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    /// Direction of the batch.
    pub direction: Direction,
    /// Written states.
    pub documents: Vec<DocumentState>,
}

/// A conflict resolved by one of the loops.
#[derive(Debug, Clone)]
pub struct ConflictEvent {
    /// Loop that ran into the conflict.
    pub direction: Direction,
    /// Handler input and normalized output.
    pub conflict: ResolvedConflict,
}

/// A failed replication pass.
#[derive(Debug, Clone)]
pub struct PassError {
    /// Direction of the failed pass.
    pub direction: Direction,
    /// The failure.
    pub error: Arc<ReplicationError>,
}

/// Senders of all replication event streams plus the statistics.
pub(crate) struct EventHub {
    processed_up: broadcast::Sender<ProcessedBatch>,
    processed_down: broadcast::Sender<ProcessedBatch>,
    conflicts: broadcast::Sender<ConflictEvent>,
    errors: broadcast::Sender<PassError>,
    stats: RwLock<ReplicationStats>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            processed_up: broadcast::channel(capacity).0,
            processed_down: broadcast::channel(capacity).0,
            conflicts: broadcast::channel(capacity).0,
            errors: broadcast::channel(capacity).0,
            stats: RwLock::new(ReplicationStats::default()),
        }
    }

    fn processed_sender(&self, direction: Direction) -> &broadcast::Sender<ProcessedBatch> {
        match direction {
            Direction::Up => &self.processed_up,
            Direction::Down => &self.processed_down,
        }
    }

    pub(crate) fn subscribe_processed(&self, direction: Direction) -> broadcast::Receiver<ProcessedBatch> {
        self.processed_sender(direction).subscribe()
    }

    pub(crate) fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.conflicts.subscribe()
    }

    pub(crate) fn subscribe_errors(&self) -> broadcast::Receiver<PassError> {
        self.errors.subscribe()
    }

    pub(crate) fn stats(&self) -> ReplicationStats {
        self.stats.read().clone()
    }

    /// Records and publishes documents written by a batch.
    pub(crate) fn processed(&self, direction: Direction, documents: Vec<DocumentState>) {
        if documents.is_empty() {
            return;
        }
        self.stats.write().direction_mut(direction).documents_written += documents.len() as u64;
        // Sending fails only without subscribers.
        let _ = self.processed_sender(direction).send(ProcessedBatch {
            direction,
            documents,
        });
    }

    pub(crate) fn conflict(&self, direction: Direction, conflict: ResolvedConflict) {
        self.stats.write().direction_mut(direction).conflicts_resolved += 1;
        let _ = self.conflicts.send(ConflictEvent {
            direction,
            conflict,
        });
    }

    pub(crate) fn pass_completed(&self, direction: Direction) {
        let mut stats = self.stats.write();
        let dir = stats.direction_mut(direction);
        dir.passes += 1;
        dir.last_pass = Some(Instant::now());
    }

    pub(crate) fn pass_failed(&self, direction: Direction, error: ReplicationError) {
        {
            let mut stats = self.stats.write();
            stats.direction_mut(direction).failed_passes += 1;
            stats.last_error = Some(error.to_string());
        }
        let _ = self.errors.send(PassError {
            direction,
            error: Arc::new(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkdb_storage::Revision;
    use serde_json::Map;

    #[test]
    fn processed_updates_stats_and_publishes() {
        let hub = EventHub::new(4);
        let mut rx = hub.subscribe_processed(Direction::Down);
        let doc = DocumentState::new("a", Revision::new(1, "h"), Map::new());

        hub.processed(Direction::Down, vec![doc]);
        hub.processed(Direction::Down, vec![]);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.direction, Direction::Down);
        assert_eq!(batch.documents.len(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.stats().down.documents_written, 1);
        assert_eq!(hub.stats().up.documents_written, 0);
    }

    #[test]
    fn failures_are_recorded() {
        let hub = EventHub::new(4);
        let mut rx = hub.subscribe_errors();
        hub.pass_failed(Direction::Up, ReplicationError::Cancelled);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.direction, Direction::Up);
        let stats = hub.stats();
        assert_eq!(stats.up.failed_passes, 1);
        assert_eq!(stats.last_error.as_deref(), Some("replication cancelled"));
    }

    #[test]
    fn completed_passes_are_counted() {
        let hub = EventHub::new(1);
        hub.pass_completed(Direction::Up);
        hub.pass_completed(Direction::Up);
        let stats = hub.stats();
        assert_eq!(stats.direction(Direction::Up).passes, 2);
        assert!(stats.up.last_pass.is_some());
        assert!(stats.down.last_pass.is_none());
    }
}
