//! Configuration for the replication engine.

/// Default number of documents fetched per batch.
pub const DEFAULT_BULK_SIZE: usize = 100;

/// Default cap on runs waiting behind the running pass of a direction.
pub const DEFAULT_MAX_PENDING_RUNS: usize = 2;

/// Default capacity of the event broadcast channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Replication identifier. Part of the checkpoint key, so changing it
    /// starts the replication from scratch.
    pub identifier: String,
    /// Maximum number of documents fetched per batch.
    pub bulk_size: usize,
    /// Maximum number of runs queued behind the running pass.
    ///
    /// Triggers arriving while the queue is full are coalesced into the
    /// already queued runs.
    pub max_pending_runs: usize,
    /// Capacity of the event broadcast channels.
    pub event_capacity: usize,
}

impl ReplicationConfig {
    /// Creates a configuration with default limits.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            bulk_size: DEFAULT_BULK_SIZE,
            max_pending_runs: DEFAULT_MAX_PENDING_RUNS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Sets the batch size (at least 1).
    pub fn with_bulk_size(mut self, size: usize) -> Self {
        self.bulk_size = size.max(1);
        self
    }

    /// Sets the pending run cap (at least 1).
    pub fn with_max_pending_runs(mut self, runs: usize) -> Self {
        self.max_pending_runs = runs.max(1);
        self
    }

    /// Sets the event channel capacity (at least 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ReplicationConfig::new("todos-sync")
            .with_bulk_size(10)
            .with_max_pending_runs(4)
            .with_event_capacity(16);

        assert_eq!(config.identifier, "todos-sync");
        assert_eq!(config.bulk_size, 10);
        assert_eq!(config.max_pending_runs, 4);
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.bulk_size, DEFAULT_BULK_SIZE);
        assert_eq!(config.max_pending_runs, DEFAULT_MAX_PENDING_RUNS);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn zero_limits_are_clamped() {
        let config = ReplicationConfig::new("x")
            .with_bulk_size(0)
            .with_max_pending_runs(0)
            .with_event_capacity(0);
        assert_eq!(config.bulk_size, 1);
        assert_eq!(config.max_pending_runs, 1);
        assert_eq!(config.event_capacity, 1);
    }
}
