//! Job Manager
//!
//! Public face of the scheduler. Creates jobs, admits them once their
//! parents are done, dispatches them to the execution engine, and handles
//! their terminal transition: commit into the undo history on success,
//! failure bookkeeping otherwise, and gate release for dependents.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use super::{
    ClipJob, DependencyGate, ExecutionEngine, JobListModel, JobRecord, JobRegistry, JobStatus,
    JobType, ProgressReporter, RunState, WorkerPoolConfig,
};
use crate::core::{
    history::{HistoryAction, HistorySink},
    ClipId, CoreError, CoreResult, JobId, Percent,
};

// =============================================================================
// Collaborators
// =============================================================================

/// Item model notified whenever a clip's job state or progress changes
pub trait ItemModel: Send + Sync {
    fn on_item_updated(&self, clip_id: &ClipId);
}

/// Item model that ignores every notification
#[derive(Debug, Default)]
pub struct NoopItemModel;

impl ItemModel for NoopItemModel {
    fn on_item_updated(&self, _clip_id: &ClipId) {}
}

/// Job lifecycle event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// Clip jobs dispatched
    Started { job_id: JobId },
    /// Job executed and committed
    Finished { job_id: JobId },
    /// A clip job returned false; nothing was committed
    ExecutionFailed { job_id: JobId, error: String },
    /// Executed, but a commit failed; the job is marked failed
    Failed { job_id: JobId, error: String },
    /// Job canceled
    Canceled { job_id: JobId },
    /// Number of available, not yet finalized clip job results, published
    /// on every start, finish and cancel
    CountChanged { count: usize },
}

// =============================================================================
// Job Request
// =============================================================================

/// Description of a job to start
#[derive(Clone, Debug)]
pub struct JobRequest {
    /// Type of job
    pub job_type: JobType,
    /// Clips to process, one clip job each
    pub clip_ids: Vec<ClipId>,
    /// Jobs that must be done before this one starts
    pub parents: Vec<JobId>,
    /// Undo history label; empty means no history entry
    pub undo_label: String,
}

impl JobRequest {
    /// Creates a request
    pub fn new<I, S>(job_type: JobType, clip_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ClipId>,
    {
        Self {
            job_type,
            clip_ids: clip_ids.into_iter().map(Into::into).collect(),
            parents: Vec::new(),
            undo_label: String::new(),
        }
    }

    /// Sets the parent jobs
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = JobId>) -> Self {
        self.parents = parents.into_iter().collect();
        self
    }

    /// Sets the undo label
    pub fn with_undo_label(mut self, label: impl Into<String>) -> Self {
        self.undo_label = label.into();
        self
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared {
    registry: Arc<JobRegistry>,
    engine: ExecutionEngine,
    items: Arc<dyn ItemModel>,
    history: Arc<dyn HistorySink>,
    job_count: watch::Sender<usize>,
    event_tx: mpsc::UnboundedSender<JobEvent>,
}

impl Shared {
    fn emit(&self, event: JobEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }

    fn notify_clips(&self, record: &JobRecord) {
        for clip_id in record.clip_ids() {
            self.items.on_item_updated(clip_id);
        }
    }

    /// Progress reporters folding values into the record and notifying the
    /// item model
    fn reporters(&self, record: &Arc<JobRecord>) -> Vec<ProgressReporter> {
        let sink: Arc<dyn Fn(usize, Percent) + Send + Sync> = {
            let record = Arc::clone(record);
            let items = Arc::clone(&self.items);
            Arc::new(move |index, percent| {
                record.update_progress(index, percent);
                if let Some(clip_id) = record.clip_ids().get(index) {
                    items.on_item_updated(clip_id);
                }
            })
        };
        (0..record.tasks().len())
            .map(|index| ProgressReporter::from_shared(index, Arc::clone(&sink)))
            .collect()
    }

    /// Recomputes the number of available results of non-terminal jobs and
    /// publishes it, changed or not
    fn update_job_count(&self) {
        let count = self.registry.read().ready_result_count();
        self.job_count.send_replace(count);
        self.emit(JobEvent::CountChanged { count });
    }

    /// Admission task body: wait for the parents, dispatch, then handle the
    /// terminal state.
    async fn run_job(self: Arc<Self>, record: Arc<JobRecord>, gate: DependencyGate) {
        let job_id = record.id();
        let handle = Arc::clone(record.execution());

        // A job canceled while waiting does not need its parents anymore
        tokio::select! {
            _ = gate.admit() => {}
            _ = handle.wait_terminal() => {
                tracing::debug!("Job {} left admission before dispatch", job_id);
            }
        }

        if self
            .engine
            .dispatch(Arc::clone(&record), self.reporters(&record))
        {
            self.emit(JobEvent::Started { job_id });
            self.update_job_count();
        }

        // Resolves at once if the job already completed or was canceled
        let state = handle.wait_terminal().await;
        self.on_terminal(job_id, state);
    }

    fn on_terminal(&self, job_id: JobId, state: RunState) {
        match state {
            RunState::Finished => self.on_job_finished(job_id),
            RunState::Canceled => self.on_job_canceled(job_id),
            RunState::NotStarted | RunState::Running => {
                tracing::warn!("Job {} is not terminal ({:?})", job_id, state);
            }
        }
    }

    /// Takes the processed mark under the exclusive lock.
    ///
    /// Returns `None` if another handler already processed the job.
    fn claim(&self, job_id: JobId) -> Option<Arc<JobRecord>> {
        let state = self.registry.write();
        let claimed = match state.job(job_id) {
            Ok(record) if record.mark_processed() => Some(Arc::clone(record)),
            Ok(_) => None,
            Err(e) => {
                tracing::error!("Terminal handler: {}", e);
                None
            }
        };
        claimed
    }

    fn on_job_canceled(&self, job_id: JobId) {
        let Some(record) = self.claim(job_id) else {
            return;
        };

        record.completion().release();
        tracing::info!("Job {} canceled", job_id);
        self.notify_clips(&record);
        self.emit(JobEvent::Canceled { job_id });
        self.update_job_count();
    }

    fn on_job_finished(&self, job_id: JobId) {
        let Some(record) = self.claim(job_id) else {
            return;
        };

        self.notify_clips(&record);

        if !record.execution().all_succeeded() {
            // Nothing to commit; `failed` only tracks commit failures
            let error = self.execution_errors(&record);
            tracing::warn!("Job {} execution failed: {}", job_id, error);
            self.emit(JobEvent::ExecutionFailed { job_id, error });
        } else if let Err(error) = self.commit(&record) {
            {
                let _state = self.registry.write();
                record.mark_failed();
            }
            tracing::warn!("Job {} failed: {}", job_id, error);
            self.emit(JobEvent::Failed { job_id, error });
        } else {
            tracing::info!("Job {} finished", job_id);
            self.emit(JobEvent::Finished { job_id });
        }

        record.completion().release();
        self.update_job_count();
    }

    /// Commits every clip job into one undo/redo pair.
    ///
    /// Stops at the first failing commit. Earlier commits of the same job
    /// are not rolled back.
    fn commit(&self, record: &JobRecord) -> Result<(), String> {
        let mut undo = HistoryAction::new();
        let mut redo = HistoryAction::new();

        for (task, clip_id) in record.tasks().iter().zip(record.clip_ids()) {
            if !task.commit_result(&mut undo, &mut redo) {
                let message = task.error_message();
                return Err(if message.is_empty() {
                    format!("commit failed for clip {clip_id}")
                } else {
                    format!("commit failed for clip {clip_id}: {message}")
                });
            }
        }

        if !record.undo_label().is_empty() {
            self.history.push_history(undo, redo, record.undo_label());
        }
        Ok(())
    }

    fn execution_errors(&self, record: &JobRecord) -> String {
        let results = record.execution().results();
        let failures: Vec<String> = record
            .tasks()
            .iter()
            .zip(record.clip_ids())
            .zip(results)
            .filter(|(_, result)| *result != Some(true))
            .map(|((task, clip_id), _)| {
                let message = task.error_message();
                if message.is_empty() {
                    format!("{clip_id}: execution failed")
                } else {
                    format!("{clip_id}: {message}")
                }
            })
            .collect();
        failures.join("; ")
    }
}

// =============================================================================
// Job Manager
// =============================================================================

/// Schedules clip jobs and tracks their lifecycle
pub struct JobManager {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    event_rx: Option<mpsc::UnboundedReceiver<JobEvent>>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.shared.registry.len())
            .field("num_workers", &self.shared.engine.num_workers())
            .finish()
    }
}

impl JobManager {
    /// Creates a manager on the current tokio runtime
    pub fn new(
        config: WorkerPoolConfig,
        items: Arc<dyn ItemModel>,
        history: Arc<dyn HistorySink>,
    ) -> CoreResult<Self> {
        let runtime = Handle::try_current().map_err(|e| CoreError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(config, runtime, items, history))
    }

    /// Creates a manager spawning onto the given runtime
    pub fn with_runtime(
        config: WorkerPoolConfig,
        runtime: Handle,
        items: Arc<dyn ItemModel>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (job_count, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                registry: Arc::new(JobRegistry::new()),
                engine: ExecutionEngine::new(&config, runtime),
                items,
                history,
                job_count,
                event_tx,
            }),
            next_id: AtomicU64::new(0),
            event_rx: Some(event_rx),
        }
    }

    /// Takes the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.event_rx.take()
    }

    /// Gets the number of configured workers
    pub fn num_workers(&self) -> usize {
        self.shared.engine.num_workers()
    }

    /// Starts a job with one clip job per requested clip.
    ///
    /// `factory` builds the clip job of each clip. The job is registered
    /// immediately and waits on its own task until every parent is done.
    /// Fails if a parent is unknown, no clip is given or a clip is repeated.
    pub fn start_job<F>(&self, request: JobRequest, mut factory: F) -> CoreResult<JobId>
    where
        F: FnMut(&ClipId) -> Arc<dyn ClipJob>,
    {
        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let tasks = request
            .clip_ids
            .iter()
            .map(|clip_id| (clip_id.clone(), factory(clip_id)))
            .collect();
        let record = Arc::new(JobRecord::new(
            job_id,
            request.job_type,
            tasks,
            request.parents,
            request.undo_label,
        )?);

        let gate = {
            let mut state = self.shared.registry.write();
            let gate = state.dependency_gate(job_id, record.parents())?;
            state.insert(Arc::clone(&record));
            gate
        };

        tracing::info!(
            "Job {} created: {:?} for {:?}, parents {:?}",
            job_id,
            record.job_type(),
            record.clip_ids(),
            record.parents()
        );

        let shared = Arc::clone(&self.shared);
        self.shared
            .engine
            .runtime()
            .spawn(shared.run_job(record, gate));

        Ok(job_id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Ids of every registered job
    pub fn job_ids(&self) -> Vec<JobId> {
        self.shared.registry.job_ids()
    }

    /// Jobs of a clip that are neither finished nor canceled
    pub fn pending_job_ids(&self, clip_id: &str, filter: Option<JobType>) -> CoreResult<Vec<JobId>> {
        self.shared.registry.pending_job_ids(clip_id, filter)
    }

    /// Jobs of a clip that are finished or canceled
    pub fn finished_job_ids(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
    ) -> CoreResult<Vec<JobId>> {
        self.shared.registry.finished_job_ids(clip_id, filter)
    }

    /// Checks if a clip has a pending job matching the filter
    pub fn has_pending_job(&self, clip_id: &str, filter: Option<JobType>) -> CoreResult<bool> {
        self.shared.registry.has_pending_job(clip_id, filter)
    }

    /// First pending job of a clip matching the filter
    pub fn find_pending_job(
        &self,
        clip_id: &str,
        filter: Option<JobType>,
    ) -> CoreResult<Option<JobId>> {
        self.shared.registry.find_pending_job(clip_id, filter)
    }

    pub fn job_type(&self, job_id: JobId) -> CoreResult<JobType> {
        self.shared.registry.job_type(job_id)
    }

    pub fn job_status(&self, job_id: JobId) -> CoreResult<JobStatus> {
        self.shared.registry.job_status(job_id)
    }

    /// True if the job executed but committing its result failed
    pub fn is_job_failed(&self, job_id: JobId) -> CoreResult<bool> {
        Ok(self.shared.registry.get(job_id)?.is_failed())
    }

    pub fn job_progress_for_clip(&self, job_id: JobId, clip_id: &str) -> CoreResult<Percent> {
        self.shared.registry.job_progress_for_clip(job_id, clip_id)
    }

    pub fn job_message_for_clip(&self, job_id: JobId, clip_id: &str) -> CoreResult<String> {
        self.shared.registry.job_message_for_clip(job_id, clip_id)
    }

    /// Current number of available, not yet finalized clip job results
    pub fn job_count(&self) -> usize {
        *self.shared.job_count.borrow()
    }

    /// Observes the job count. A new value is sent on every start, finish
    /// and cancel, even when the count did not change.
    pub fn subscribe_job_count(&self) -> watch::Receiver<usize> {
        self.shared.job_count.subscribe()
    }

    /// Read-only list view over the registered jobs
    pub fn list_model(&self) -> JobListModel {
        JobListModel::new(Arc::clone(&self.shared.registry))
    }

    /// Waits until the job's terminal handler completed and returns its status
    pub async fn wait_for_job(&self, job_id: JobId) -> CoreResult<JobStatus> {
        let record = self.shared.registry.get(job_id)?;
        record.completion().wait().await;
        Ok(record.status())
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancels a clip's jobs of the given type (all types for `None`).
    ///
    /// Unknown clips are ignored.
    pub fn discard_jobs(&self, clip_id: &str, filter: Option<JobType>) {
        let canceled = self.shared.registry.discard_jobs(clip_id, filter);
        tracing::debug!("Discarded {} job(s) of clip {}", canceled, clip_id);
    }

    /// Cancels every job of a clip, failing for unknown clips
    pub fn discard_clip_jobs(&self, clip_id: &str) -> CoreResult<()> {
        let canceled = self.shared.registry.discard_clip_jobs(clip_id)?;
        tracing::debug!("Discarded {} job(s) of clip {}", canceled, clip_id);
        Ok(())
    }

    /// Cancels one job. Returns false if it was already finished or canceled.
    pub fn cancel_job(&self, job_id: JobId) -> CoreResult<bool> {
        let canceled = self.shared.registry.write().job(job_id)?.execution().cancel();
        tracing::debug!("Cancel job {}: {}", job_id, canceled);
        Ok(canceled)
    }

    /// Cancels every job that was not dispatched yet
    pub fn cancel_pending(&self) {
        let canceled = self.shared.registry.cancel_pending();
        tracing::info!("Canceled {} pending job(s)", canceled);
    }

    /// Cancels every job
    pub fn cancel_all(&self) {
        let canceled = self.shared.registry.cancel_all();
        tracing::info!("Canceled {} job(s)", canceled);
    }

    /// Direct access to the terminal handlers, bypassing the execution handle
    #[cfg(test)]
    pub(crate) fn terminal_handler(&self) -> impl Fn(JobId, RunState) + Send + Sync + 'static {
        let shared = Arc::clone(&self.shared);
        move |job_id, state| shared.on_terminal(job_id, state)
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shared.registry.cancel_all();
    }
}
