//! Job Registry
//!
//! Table of every known job, indexed by job id and by owning clip.
//!
//! Queries take the shared lock; structural changes (insertion, bulk and
//! selective cancellation) take the exclusive lock. Unknown job or clip ids
//! are contract violations reported as lookup errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{ClipJob, DependencyGate, JobRecord, JobStatus, JobType};
use crate::core::{ClipId, CoreError, CoreResult, JobId, Percent};

// =============================================================================
// Registry State
// =============================================================================

/// Registry content, only reachable through a lock guard
#[derive(Debug, Default)]
pub struct RegistryState {
    jobs: BTreeMap<JobId, Arc<JobRecord>>,
    jobs_by_clip: HashMap<ClipId, Vec<JobId>>,
}

impl RegistryState {
    /// Looks up a job
    pub fn job(&self, job_id: JobId) -> CoreResult<&Arc<JobRecord>> {
        self.jobs.get(&job_id).ok_or(CoreError::JobNotFound(job_id))
    }

    /// Every job of a clip, oldest first
    pub fn clip_jobs(&self, clip_id: &str) -> CoreResult<Vec<&Arc<JobRecord>>> {
        let ids = self
            .jobs_by_clip
            .get(clip_id)
            .ok_or_else(|| CoreError::ClipNotFound(clip_id.to_string()))?;
        ids.iter().map(|id| self.job(*id)).collect()
    }

    pub fn has_clip(&self, clip_id: &str) -> bool {
        self.jobs_by_clip.contains_key(clip_id)
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Arc<JobRecord>> {
        self.jobs.values()
    }

    /// Job at a given row, rows being ordered by job id
    pub fn nth(&self, row: usize) -> Option<&Arc<JobRecord>> {
        self.jobs.values().nth(row)
    }

    fn matching(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
        done: bool,
    ) -> CoreResult<Vec<JobId>> {
        Ok(self
            .clip_jobs(clip_id)?
            .into_iter()
            .filter(|job| job.job_type().matches(filter) && job.status().is_done() == done)
            .map(|job| job.id())
            .collect())
    }

    /// Jobs of a clip that are neither finished nor canceled
    pub fn pending_job_ids(&self, clip_id: &str, filter: Option<JobType>) -> CoreResult<Vec<JobId>> {
        self.matching(clip_id, filter, false)
    }

    /// Jobs of a clip that are finished or canceled
    pub fn finished_job_ids(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
    ) -> CoreResult<Vec<JobId>> {
        self.matching(clip_id, filter, true)
    }

    /// First pending job of a clip matching the filter
    pub fn find_pending_job(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
    ) -> CoreResult<Option<JobId>> {
        Ok(self.pending_job_ids(clip_id, filter)?.first().copied())
    }

    /// Resolves the parents of a job into a dependency gate
    pub fn dependency_gate(&self, job_id: JobId, parents: &[JobId]) -> CoreResult<DependencyGate> {
        let gates = parents
            .iter()
            .map(|parent| Ok((*parent, self.job(*parent)?.completion().clone())))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(DependencyGate::new(job_id, gates))
    }

    /// Number of clip job results available across non-terminal jobs
    pub fn ready_result_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| !job.execution().state().is_terminal())
            .map(|job| job.execution().ready_result_count())
            .sum()
    }

    pub(crate) fn insert(&mut self, record: Arc<JobRecord>) {
        for clip_id in record.clip_ids() {
            self.jobs_by_clip
                .entry(clip_id.clone())
                .or_default()
                .push(record.id());
        }
        self.jobs.insert(record.id(), record);
    }

    /// Requests cancellation of a clip's jobs matching the filter.
    ///
    /// Unknown clips are ignored. Returns how many jobs changed state.
    pub(crate) fn discard_jobs(&self, clip_id: &str, filter: Option<JobType>) -> usize {
        let Ok(jobs) = self.clip_jobs(clip_id) else {
            return 0;
        };
        jobs.into_iter()
            .filter(|job| job.job_type().matches(filter))
            .filter(|job| job.execution().cancel())
            .count()
    }

    pub(crate) fn cancel_all(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.execution().cancel())
            .count()
    }

    /// Cancels the jobs that were not dispatched yet
    pub(crate) fn cancel_pending(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| !job.execution().is_started())
            .filter(|job| job.execution().cancel())
            .count()
    }
}

// =============================================================================
// Job Registry
// =============================================================================

/// Thread safe job table
#[derive(Debug, Default)]
pub struct JobRegistry {
    state: RwLock<RegistryState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access. Readers never block each other.
    ///
    /// Critical sections never leave the state half-updated, so a poisoned
    /// lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access
    pub fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a job, cloning the shared record out of the lock
    pub fn get(&self, job_id: JobId) -> CoreResult<Arc<JobRecord>> {
        self.read().job(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.read().iter().map(|job| job.id()).collect()
    }

    pub fn pending_job_ids(&self, clip_id: &str, filter: Option<JobType>) -> CoreResult<Vec<JobId>> {
        self.read().pending_job_ids(clip_id, filter)
    }

    pub fn finished_job_ids(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
    ) -> CoreResult<Vec<JobId>> {
        self.read().finished_job_ids(clip_id, filter)
    }

    pub fn find_pending_job(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
    ) -> CoreResult<Option<JobId>> {
        self.read().find_pending_job(clip_id, filter)
    }

    pub fn has_pending_job(&self, clip_id: &str, filter: Option<JobType>) -> CoreResult<bool> {
        Ok(self.find_pending_job(clip_id, filter)?.is_some())
    }

    pub fn job_type(&self, job_id: JobId) -> CoreResult<JobType> {
        Ok(self.read().job(job_id)?.job_type())
    }

    pub fn job_status(&self, job_id: JobId) -> CoreResult<JobStatus> {
        Ok(self.read().job(job_id)?.status())
    }

    pub fn job_progress_for_clip(&self, job_id: JobId, clip_id: &str) -> CoreResult<Percent> {
        let state = self.read();
        let job = state.job(job_id)?;
        Ok(job.progress_at(job.index_of(clip_id)?))
    }

    /// Error message of a clip's job.
    ///
    /// The clip job is queried after the lock is released.
    pub fn job_message_for_clip(&self, job_id: JobId, clip_id: &str) -> CoreResult<String> {
        let task: Arc<dyn ClipJob> = {
            let state = self.read();
            let job = state.job(job_id)?;
            Arc::clone(&job.tasks()[job.index_of(clip_id)?])
        };
        Ok(task.error_message())
    }

    /// Cancels a clip's jobs matching the filter; unknown clips are ignored
    pub fn discard_jobs(&self, clip_id: &str, filter: Option<JobType>) -> usize {
        self.write().discard_jobs(clip_id, filter)
    }

    /// Cancels every job of a known clip
    pub fn discard_clip_jobs(&self, clip_id: &str) -> CoreResult<usize> {
        let state = self.write();
        if !state.has_clip(clip_id) {
            return Err(CoreError::ClipNotFound(clip_id.to_string()));
        }
        Ok(state.discard_jobs(clip_id, None))
    }

    pub fn cancel_all(&self) -> usize {
        self.write().cancel_all()
    }

    pub fn cancel_pending(&self) -> usize {
        self.write().cancel_pending()
    }
}
