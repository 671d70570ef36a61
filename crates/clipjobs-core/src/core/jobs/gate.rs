//! Dependency Gate
//!
//! Admission control: a job is only dispatched once every parent job has
//! reached a terminal state.

use super::CompletionGate;
use crate::core::JobId;

/// Waits for the completion gates of a job's parents
#[derive(Debug, Clone)]
pub struct DependencyGate {
    job_id: JobId,
    parents: Vec<(JobId, CompletionGate)>,
}

impl DependencyGate {
    /// Creates a gate for `job_id` over the given parent gates
    pub fn new(job_id: JobId, parents: Vec<(JobId, CompletionGate)>) -> Self {
        Self { job_id, parents }
    }

    pub fn parent_ids(&self) -> Vec<JobId> {
        self.parents.iter().map(|(id, _)| *id).collect()
    }

    /// One sweep over the parents without waiting
    pub fn is_open(&self) -> bool {
        self.parents.iter().all(|(_, gate)| gate.is_released())
    }

    /// Resolves once every parent is terminal.
    ///
    /// Parents are swept in order. On the first closed gate the sweep waits
    /// for it to open and then restarts from the first parent, so admission
    /// only happens after a full sweep that saw every gate open.
    pub async fn admit(&self) {
        'sweep: loop {
            for (parent_id, gate) in &self.parents {
                if !gate.is_released() {
                    tracing::debug!("Job {} waiting for parent job {}", self.job_id, parent_id);
                    gate.wait().await;
                    continue 'sweep;
                }
            }
            break;
        }
        if !self.parents.is_empty() {
            tracing::debug!("Job {} admitted", self.job_id);
        }
    }
}
