//! Conflict resolution contract.
//!
//! A conflict arises when a replication write is rejected because the
//! destination moved on since the branch point. The engine decides *when* a
//! handler runs; the handler decides *what* the merged state is.

use forkdb_storage::DocumentState;

/// Input handed to a [`ConflictHandler`]. All states carry no replication flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInput {
    /// The master state both sides last agreed on, if any.
    pub document_state_at_fork_time: Option<DocumentState>,
    /// The state currently held by master.
    pub new_document_state_in_master: DocumentState,
    /// The state currently held by fork.
    pub current_fork_document_state: DocumentState,
}

impl ConflictInput {
    /// Creates an input, stripping replication flags from every state.
    pub fn new(
        document_state_at_fork_time: Option<&DocumentState>,
        new_document_state_in_master: &DocumentState,
        current_fork_document_state: &DocumentState,
    ) -> Self {
        Self {
            document_state_at_fork_time: document_state_at_fork_time
                .map(DocumentState::without_replication_flags),
            new_document_state_in_master: new_document_state_in_master.without_replication_flags(),
            current_fork_document_state: current_fork_document_state.without_replication_flags(),
        }
    }

    /// Returns true if master and fork hold the same revision.
    pub fn same_revision(&self) -> bool {
        self.new_document_state_in_master.revision == self.current_fork_document_state.revision
    }

    /// Returns true if master and fork hold the same content.
    pub fn same_content(&self) -> bool {
        self.new_document_state_in_master
            .same_content(&self.current_fork_document_state)
    }
}

/// Output of a [`ConflictHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutput {
    /// Master's state is kept as is.
    AlreadyEqual,
    /// The merged state to store on both sides.
    ///
    /// Its revision and metadata are replaced by the engine.
    Resolved(DocumentState),
}

impl ConflictOutput {
    /// Collapses a resolution equal to master's content into `AlreadyEqual`.
    pub fn normalize(self, input: &ConflictInput) -> Self {
        match self {
            ConflictOutput::Resolved(doc) if doc.same_content(&input.new_document_state_in_master) => {
                ConflictOutput::AlreadyEqual
            }
            other => other,
        }
    }

    /// Returns true if master's state is kept.
    pub fn is_already_equal(&self) -> bool {
        matches!(self, ConflictOutput::AlreadyEqual)
    }
}

/// Resolves replication conflicts.
///
/// Handlers must be deterministic: the upstream and downstream loops may both
/// run into the same conflict and must agree on the result.
pub trait ConflictHandler: Send + Sync {
    /// Returns the merged state for `input`.
    fn resolve(&self, input: &ConflictInput) -> ConflictOutput;
}

impl<F> ConflictHandler for F
where
    F: Fn(&ConflictInput) -> ConflictOutput + Send + Sync,
{
    fn resolve(&self, input: &ConflictInput) -> ConflictOutput {
        self(input)
    }
}

/// Built-in conflict handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Master's state always wins.
    #[default]
    MasterWins,
    /// Fork's state always wins.
    ForkWins,
    /// The state with the higher `lwt` wins; ties go to master.
    LastWriteWins,
}

impl ConflictHandler for ConflictPolicy {
    fn resolve(&self, input: &ConflictInput) -> ConflictOutput {
        if input.same_content() {
            return ConflictOutput::AlreadyEqual;
        }
        let master = &input.new_document_state_in_master;
        let fork = &input.current_fork_document_state;
        let fork_wins = match self {
            ConflictPolicy::MasterWins => false,
            ConflictPolicy::ForkWins => true,
            ConflictPolicy::LastWriteWins => fork.meta.lwt > master.meta.lwt,
        };
        if fork_wins {
            ConflictOutput::Resolved(fork.clone())
        } else {
            ConflictOutput::AlreadyEqual
        }
    }
}

/// A conflict together with how it was resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    /// Handler input.
    pub input: ConflictInput,
    /// Normalized handler output.
    pub output: ConflictOutput,
}
