//! History Module
//!
//! Undo/redo accumulation for job commits and the bounded undo stack that
//! receives one entry per successfully committed job.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::{CoreError, CoreResult, HistoryId};

// =============================================================================
// Actions
// =============================================================================

/// A single undo or redo step. Returns false when the step could not be applied.
pub type Fun = Box<dyn FnMut() -> bool + Send>;

/// Ordered sequence of steps that is replayed as one unit.
///
/// Clip jobs contribute to a pair of actions while committing their result:
/// redo steps are appended, undo steps are prepended so that undoing replays
/// the inverse operations in reverse order.
#[derive(Default)]
pub struct HistoryAction {
    steps: Vec<Fun>,
}

impl HistoryAction {
    /// Creates an empty action (a no-op that always succeeds)
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step that runs after the existing ones
    pub fn push(&mut self, step: impl FnMut() -> bool + Send + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Inserts a step that runs before the existing ones
    pub fn prepend(&mut self, step: impl FnMut() -> bool + Send + 'static) {
        self.steps.insert(0, Box::new(step));
    }

    /// Runs every step in order, stopping at the first failing one
    pub fn run(&mut self) -> bool {
        self.steps.iter_mut().all(|step| step())
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no step was recorded
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryAction")
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// Records one reversible operation into an undo/redo pair.
pub fn push_step(
    undo: &mut HistoryAction,
    redo: &mut HistoryAction,
    undo_step: impl FnMut() -> bool + Send + 'static,
    redo_step: impl FnMut() -> bool + Send + 'static,
) {
    undo.prepend(undo_step);
    redo.push(redo_step);
}

// =============================================================================
// History Sink
// =============================================================================

/// Receiver of committed job results
pub trait HistorySink: Send + Sync {
    /// Records a labeled undo/redo pair as a single history entry
    fn push_history(&self, undo: HistoryAction, redo: HistoryAction, label: &str);
}

// =============================================================================
// Undo Stack
// =============================================================================

/// Entry in the undo/redo history
pub struct HistoryEntry {
    /// Entry ID
    pub id: HistoryId,
    /// User visible label
    pub label: String,
    /// Timestamp when the entry was recorded
    pub timestamp: String,
    undo: HistoryAction,
    redo: HistoryAction,
}

impl fmt::Debug for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryEntry")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl HistoryEntry {
    fn new(undo: HistoryAction, redo: HistoryAction, label: &str) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            label: label.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            undo,
            redo,
        }
    }
}

struct Stacks {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
}

/// Bounded undo/redo history fed by the job manager
pub struct UndoStack {
    stacks: Mutex<Stacks>,
    max_history_size: usize,
}

impl UndoStack {
    /// Creates an empty history holding at most 100 entries
    pub fn new() -> Self {
        Self {
            stacks: Mutex::new(Stacks {
                undo_stack: VecDeque::new(),
                redo_stack: VecDeque::new(),
            }),
            max_history_size: 100,
        }
    }

    /// Sets the maximum history size
    pub fn with_max_history(mut self, size: usize) -> Self {
        self.max_history_size = size.max(1);
        self
    }

    fn stacks(&self) -> MutexGuard<'_, Stacks> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Undoes the last entry.
    ///
    /// Steps run without holding the history lock. A failing entry is put
    /// back on the undo stack.
    pub fn undo(&self) -> CoreResult<String> {
        let mut entry = self
            .stacks()
            .undo_stack
            .pop_back()
            .ok_or(CoreError::NothingToUndo)?;

        let ok = entry.undo.run();
        let label = entry.label.clone();
        let mut stacks = self.stacks();
        if !ok {
            stacks.undo_stack.push_back(entry);
            return Err(CoreError::HistoryStepFailed(format!("undo {label}")));
        }
        stacks.redo_stack.push_back(entry);
        Ok(label)
    }

    /// Redoes the last undone entry
    pub fn redo(&self) -> CoreResult<String> {
        let mut entry = self
            .stacks()
            .redo_stack
            .pop_back()
            .ok_or(CoreError::NothingToRedo)?;

        let ok = entry.redo.run();
        let label = entry.label.clone();
        let mut stacks = self.stacks();
        if !ok {
            stacks.redo_stack.push_back(entry);
            return Err(CoreError::HistoryStepFailed(format!("redo {label}")));
        }
        entry.timestamp = chrono::Utc::now().to_rfc3339();
        stacks.undo_stack.push_back(entry);
        Ok(label)
    }

    /// Returns true if undo is available
    pub fn can_undo(&self) -> bool {
        !self.stacks().undo_stack.is_empty()
    }

    /// Returns true if redo is available
    pub fn can_redo(&self) -> bool {
        !self.stacks().redo_stack.is_empty()
    }

    /// Returns the number of entries in the undo stack
    pub fn undo_count(&self) -> usize {
        self.stacks().undo_stack.len()
    }

    /// Returns the number of entries in the redo stack
    pub fn redo_count(&self) -> usize {
        self.stacks().redo_stack.len()
    }

    /// Labels of the undo stack, oldest first
    pub fn labels(&self) -> Vec<String> {
        self.stacks()
            .undo_stack
            .iter()
            .map(|e| e.label.clone())
            .collect()
    }

    /// Label of the entry that would be undone next
    pub fn last_label(&self) -> Option<String> {
        self.stacks().undo_stack.back().map(|e| e.label.clone())
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

impl HistorySink for UndoStack {
    fn push_history(&self, undo: HistoryAction, redo: HistoryAction, label: &str) {
        let mut stacks = self.stacks();

        // A new entry invalidates everything that was undone
        stacks.redo_stack.clear();
        stacks
            .undo_stack
            .push_back(HistoryEntry::new(undo, redo, label));

        while stacks.undo_stack.len() > self.max_history_size {
            stacks.undo_stack.pop_front();
        }
        tracing::debug!("History entry pushed: {}", label);
    }
}

// =============================================================================
// Tests
// =============================================================================
