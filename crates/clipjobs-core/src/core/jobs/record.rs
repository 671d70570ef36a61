//! Job Records
//!
//! Data held for every scheduled job: its clip jobs, parents, progress and
//! terminal bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::{ClipJob, ExecutionHandle, JobStatus, JobType};
use crate::core::{ClipId, CoreError, CoreResult, JobId, Percent};

// =============================================================================
// Completion Gate
// =============================================================================

/// One-shot "job is done" signal.
///
/// Created closed when the job is registered and opened exactly once by the
/// first terminal handler. Dependents only ever test or await it.
#[derive(Clone, Debug)]
pub struct CompletionGate {
    released: Arc<watch::Sender<bool>>,
}

impl CompletionGate {
    /// Creates a closed gate
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            released: Arc::new(tx),
        }
    }

    /// Opens the gate. Returns false if it was already open.
    pub fn release(&self) -> bool {
        self.released.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        })
    }

    /// Non-blocking test of the gate
    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Waits until the gate is opened
    pub async fn wait(&self) {
        let mut rx = self.released.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Job Record
// =============================================================================

/// A scheduled job
pub struct JobRecord {
    id: JobId,
    job_type: JobType,
    clip_ids: Vec<ClipId>,
    indices: HashMap<ClipId, usize>,
    tasks: Vec<Arc<dyn ClipJob>>,
    progress: Vec<AtomicU32>,
    parents: Vec<JobId>,
    undo_label: String,
    created_at: String,
    execution: Arc<ExecutionHandle>,
    completion: CompletionGate,
    processed: AtomicBool,
    failed: AtomicBool,
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("clip_ids", &self.clip_ids)
            .field("parents", &self.parents)
            .field("status", &self.status())
            .finish()
    }
}

impl JobRecord {
    /// Builds a record from `(clip id, clip job)` pairs.
    ///
    /// Fails if no clip is given or a clip appears twice.
    pub fn new(
        id: JobId,
        job_type: JobType,
        tasks: Vec<(ClipId, Arc<dyn ClipJob>)>,
        parents: Vec<JobId>,
        undo_label: String,
    ) -> CoreResult<Self> {
        if tasks.is_empty() {
            return Err(CoreError::InvalidJob(format!("job {id} has no clip")));
        }

        let mut clip_ids = Vec::with_capacity(tasks.len());
        let mut indices = HashMap::with_capacity(tasks.len());
        let mut jobs = Vec::with_capacity(tasks.len());
        for (index, (clip_id, task)) in tasks.into_iter().enumerate() {
            if indices.insert(clip_id.clone(), index).is_some() {
                return Err(CoreError::InvalidJob(format!(
                    "clip {clip_id} appears twice in job {id}"
                )));
            }
            clip_ids.push(clip_id);
            jobs.push(task);
        }

        let progress = (0..jobs.len()).map(|_| AtomicU32::new(0)).collect();
        let execution = Arc::new(ExecutionHandle::new(jobs.len()));

        Ok(Self {
            id,
            job_type,
            clip_ids,
            indices,
            tasks: jobs,
            progress,
            parents,
            undo_label,
            created_at: chrono::Utc::now().to_rfc3339(),
            execution,
            completion: CompletionGate::new(),
            processed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Owning clips, in clip job order
    pub fn clip_ids(&self) -> &[ClipId] {
        &self.clip_ids
    }

    pub fn tasks(&self) -> &[Arc<dyn ClipJob>] {
        &self.tasks
    }

    pub fn parents(&self) -> &[JobId] {
        &self.parents
    }

    pub fn undo_label(&self) -> &str {
        &self.undo_label
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn execution(&self) -> &Arc<ExecutionHandle> {
        &self.execution
    }

    pub fn completion(&self) -> &CompletionGate {
        &self.completion
    }

    /// Status derived from the execution handle
    pub fn status(&self) -> JobStatus {
        self.execution.state().into()
    }

    /// Position of a clip's job, if the clip belongs to this job
    pub fn index_of(&self, clip_id: &str) -> CoreResult<usize> {
        self.indices
            .get(clip_id)
            .copied()
            .ok_or_else(|| CoreError::ClipNotInJob {
                job_id: self.id,
                clip_id: clip_id.to_string(),
            })
    }

    /// Folds a reported value into the clip job's progress.
    ///
    /// Progress never decreases. Returns the stored value.
    pub fn update_progress(&self, index: usize, percent: Percent) -> Percent {
        match self.progress.get(index) {
            Some(slot) => slot.fetch_max(percent, Ordering::AcqRel).max(percent),
            None => 0,
        }
    }

    /// Current progress of the clip job at `index`
    pub fn progress_at(&self, index: usize) -> Percent {
        self.progress
            .get(index)
            .map_or(0, |slot| slot.load(Ordering::Acquire))
    }

    /// Progress of every clip job
    pub fn progress(&self) -> Vec<Percent> {
        self.progress
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }

    /// Description of the first clip job
    pub fn description(&self) -> String {
        self.tasks
            .first()
            .map(|task| task.description())
            .unwrap_or_default()
    }

    /// Marks the record processed. Returns false if it already was.
    ///
    /// Must be called with the registry write lock held.
    pub(crate) fn mark_processed(&self) -> bool {
        !self.processed.swap(true, Ordering::AcqRel)
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// Must be called with the registry write lock held.
    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}
