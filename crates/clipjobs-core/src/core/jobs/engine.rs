//! Execution Engine
//!
//! Runs the clip jobs of an admitted job in parallel on the async runtime,
//! bounded by a shared worker pool, and tracks the aggregate outcome in an
//! [`ExecutionHandle`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use super::{JobContext, JobRecord, JobStatus, ProgressReporter};

// =============================================================================
// Worker Pool Configuration
// =============================================================================

/// Worker pool configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Maximum number of clip jobs executing at once
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(2),
        }
    }
}

// =============================================================================
// Execution Handle
// =============================================================================

/// Aggregate execution state of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Not dispatched yet
    NotStarted,
    /// Clip jobs dispatched
    Running,
    /// Every clip job reached a result
    Finished,
    /// Cancellation requested
    Canceled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Canceled)
    }
}

impl From<RunState> for JobStatus {
    fn from(state: RunState) -> Self {
        match state {
            RunState::NotStarted => JobStatus::Pending,
            RunState::Running => JobStatus::Running,
            RunState::Finished => JobStatus::Finished,
            RunState::Canceled => JobStatus::Canceled,
        }
    }
}

/// Handle on the execution of one job.
///
/// Terminal states are exclusive and sticky: a canceled job never reports
/// finished, even when its clip jobs wind down later.
#[derive(Debug)]
pub struct ExecutionHandle {
    state: watch::Sender<RunState>,
    cancel_tx: watch::Sender<bool>,
    results: Mutex<Vec<Option<bool>>>,
}

impl ExecutionHandle {
    /// Creates a handle for `task_count` clip jobs
    pub fn new(task_count: usize) -> Self {
        let (state, _) = watch::channel(RunState::NotStarted);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            state,
            cancel_tx,
            results: Mutex::new(vec![None; task_count]),
        }
    }

    fn results_guard(&self) -> MutexGuard<'_, Vec<Option<bool>>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// True once the handle left the not-started state
    pub fn is_started(&self) -> bool {
        self.state() != RunState::NotStarted
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RunState::Finished
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == RunState::Canceled
    }

    /// Requests cancellation.
    ///
    /// Returns false if the handle was already terminal. Running clip jobs
    /// are only asked to stop.
    pub fn cancel(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = RunState::Canceled;
                true
            }
        });
        if changed {
            self.cancel_tx.send_replace(true);
        }
        changed
    }

    /// Moves from not-started to running. Fails if already canceled.
    pub(crate) fn start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RunState::NotStarted {
                *state = RunState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Moves from running to finished unless canceled in between
    pub(crate) fn finish(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Finished;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_result(&self, index: usize, ok: bool) {
        if let Some(slot) = self.results_guard().get_mut(index) {
            *slot = Some(ok);
        }
    }

    /// Individual clip job results, `None` while not available
    pub fn results(&self) -> Vec<Option<bool>> {
        self.results_guard().clone()
    }

    /// Number of clip jobs whose result is available
    pub fn ready_result_count(&self) -> usize {
        self.results_guard().iter().filter(|r| r.is_some()).count()
    }

    /// True if every clip job returned true
    pub fn all_succeeded(&self) -> bool {
        self.results_guard().iter().all(|r| *r == Some(true))
    }

    /// Cancellation flag handed to clip jobs
    pub fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Waits for a terminal state and returns it
    pub async fn wait_terminal(&self) -> RunState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

// =============================================================================
// Execution Engine
// =============================================================================

/// Dispatches clip jobs onto the runtime
pub struct ExecutionEngine {
    permits: Arc<Semaphore>,
    num_workers: usize,
    runtime: Handle,
}

impl ExecutionEngine {
    /// Creates an engine spawning onto `runtime`
    pub fn new(config: &WorkerPoolConfig, runtime: Handle) -> Self {
        let num_workers = config.num_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(num_workers)),
            num_workers,
            runtime,
        }
    }

    /// Gets the number of configured workers
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers not currently running a clip job
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Runs every clip job of `record` concurrently.
    ///
    /// Returns false without dispatching if the job was canceled first. The
    /// handle turns finished once every clip job returned, unless it was
    /// canceled meanwhile. A panicking clip job counts as a failure.
    pub fn dispatch(&self, record: Arc<JobRecord>, reporters: Vec<ProgressReporter>) -> bool {
        let handle = Arc::clone(record.execution());
        if !handle.start() {
            return false;
        }

        tracing::info!(
            "Job {} dispatched: {:?} on {} clip(s)",
            record.id(),
            record.job_type(),
            record.tasks().len()
        );

        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            let mut workers = JoinSet::new();

            for (index, (task, reporter)) in record.tasks().iter().zip(reporters).enumerate() {
                let task = Arc::clone(task);
                let permits = Arc::clone(&permits);
                let ctx = JobContext::new(
                    record.id(),
                    index,
                    record.clip_ids()[index].clone(),
                    reporter,
                    handle.subscribe_cancel(),
                );

                workers.spawn(async move {
                    let permit = tokio::select! {
                        permit = permits.acquire_owned() => permit.ok(),
                        _ = ctx.canceled() => None,
                    };
                    let Some(_permit) = permit else {
                        return (index, None);
                    };
                    if ctx.is_canceled() {
                        return (index, None);
                    }

                    let clip_id = ctx.clip_id().clone();
                    let outcome = tokio::spawn(async move { task.execute(&ctx).await }).await;
                    match outcome {
                        Ok(ok) => (index, Some(ok)),
                        Err(e) => {
                            tracing::error!("Clip job for {} aborted: {}", clip_id, e);
                            (index, Some(false))
                        }
                    }
                });
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((index, Some(ok))) => handle.set_result(index, ok),
                    Ok((index, None)) => {
                        tracing::debug!("Job {} clip job {} skipped", record.id(), index);
                    }
                    Err(e) => tracing::error!("Job {} worker failed: {}", record.id(), e),
                }
            }

            if handle.finish() {
                tracing::debug!("Job {} execution finished", record.id());
            }
        });

        true
    }
}
