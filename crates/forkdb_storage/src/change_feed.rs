//! Change notifications emitted after writes.

use crate::document::DocumentState;

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    /// Document was inserted (no live previous state existed).
    Insert,
    /// Document was updated.
    Update,
    /// Document was deleted.
    Delete,
}

/// The document states involved in a change.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Type of change.
    pub operation: ChangeOperation,
    /// New state (absent for some backends on delete).
    pub doc: Option<DocumentState>,
    /// Previous state (for Update/Delete).
    pub previous: Option<DocumentState>,
}

/// A single change event.
///
/// Change events are emitted only after the write was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Primary key of the changed document.
    pub document_id: String,
    /// The change itself.
    pub change: DocumentChange,
}

impl ChangeEvent {
    /// Creates an insert event.
    pub fn insert(doc: DocumentState) -> Self {
        Self {
            document_id: doc.primary_key.clone(),
            change: DocumentChange {
                operation: ChangeOperation::Insert,
                doc: Some(doc),
                previous: None,
            },
        }
    }

    /// Creates an update event.
    pub fn update(doc: DocumentState, previous: DocumentState) -> Self {
        Self {
            document_id: doc.primary_key.clone(),
            change: DocumentChange {
                operation: ChangeOperation::Update,
                doc: Some(doc),
                previous: Some(previous),
            },
        }
    }

    /// Creates a delete event.
    pub fn delete(doc: DocumentState, previous: Option<DocumentState>) -> Self {
        Self {
            document_id: doc.primary_key.clone(),
            change: DocumentChange {
                operation: ChangeOperation::Delete,
                doc: Some(doc),
                previous,
            },
        }
    }

    /// Classifies a write of `doc` over `previous`.
    pub fn from_write(doc: DocumentState, previous: Option<DocumentState>) -> Self {
        match previous {
            _ if doc.deleted => Self::delete(doc, previous),
            Some(prev) if !prev.deleted => Self::update(doc, prev),
            _ => Self::insert(doc),
        }
    }

    /// Returns the state after the change, falling back to the previous one.
    pub fn latest_state(&self) -> Option<&DocumentState> {
        self.change.doc.as_ref().or(self.change.previous.as_ref())
    }
}

/// All events produced by one bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBulk {
    /// Events in write order.
    pub events: Vec<ChangeEvent>,
}

impl EventBulk {
    /// Returns true if the bulk has no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
