//! Clip Job Contract
//!
//! A job is made of one clip job per owning clip. Clip jobs are opaque to
//! the scheduler: they execute, report progress, and commit their result
//! into the undo history when the whole job succeeded.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::core::{history::HistoryAction, ClipId, JobId, Percent};

// =============================================================================
// Clip Job Trait
// =============================================================================

/// Unit of work applied to a single clip
///
/// # Example
/// ```rust,ignore
/// struct ProxyJob { clip_id: ClipId }
///
/// #[async_trait]
/// impl ClipJob for ProxyJob {
///     async fn execute(&self, ctx: &JobContext) -> bool {
///         for p in (0..=100).step_by(10) {
///             if ctx.is_canceled() {
///                 return false;
///             }
///             ctx.report_progress(p);
///         }
///         true
///     }
///
///     fn commit_result(&self, undo: &mut HistoryAction, redo: &mut HistoryAction) -> bool {
///         // Swap the clip producer for its proxy
///         true
///     }
///
///     fn description(&self) -> String {
///         format!("Creating proxy for {}", self.clip_id)
///     }
/// }
/// ```
#[async_trait]
pub trait ClipJob: Send + Sync {
    /// Runs the work. Returns false on failure; the reason is exposed
    /// through [`ClipJob::error_message`].
    ///
    /// Cancellation is cooperative: implementations should poll
    /// [`JobContext::is_canceled`] or await [`JobContext::canceled`].
    async fn execute(&self, ctx: &JobContext) -> bool;

    /// Applies the result, recording the inverse operation in `undo` and
    /// the forward operation in `redo`.
    ///
    /// Only called after every clip job of the job executed successfully.
    fn commit_result(&self, undo: &mut HistoryAction, redo: &mut HistoryAction) -> bool;

    /// Human readable description, shown in job lists
    fn description(&self) -> String;

    /// Last error message, empty when the job did not fail
    fn error_message(&self) -> String {
        String::new()
    }
}

// =============================================================================
// Progress
// =============================================================================

type ProgressSink = Arc<dyn Fn(usize, Percent) + Send + Sync>;

/// Forwards `(clip job index, percent)` progress events to the manager
#[derive(Clone)]
pub struct ProgressReporter {
    index: usize,
    sink: ProgressSink,
}

impl ProgressReporter {
    /// Creates a reporter for the clip job at `index`
    pub fn new(index: usize, sink: impl Fn(usize, Percent) + Send + Sync + 'static) -> Self {
        Self {
            index,
            sink: Arc::new(sink),
        }
    }

    pub(crate) fn from_shared(index: usize, sink: ProgressSink) -> Self {
        Self { index, sink }
    }

    /// Reporter that drops every event
    pub fn noop(index: usize) -> Self {
        Self::new(index, |_, _| {})
    }

    /// Reports a progress value
    pub fn report(&self, percent: Percent) {
        (self.sink)(self.index, percent);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("index", &self.index)
            .finish()
    }
}

// =============================================================================
// Job Context
// =============================================================================

/// Execution context handed to a running clip job
#[derive(Debug)]
pub struct JobContext {
    job_id: JobId,
    index: usize,
    clip_id: ClipId,
    progress: ProgressReporter,
    cancel_rx: watch::Receiver<bool>,
}

impl JobContext {
    /// Creates a context
    pub fn new(
        job_id: JobId,
        index: usize,
        clip_id: ClipId,
        progress: ProgressReporter,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            index,
            clip_id,
            progress,
            cancel_rx,
        }
    }

    /// Job this clip job belongs to
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Position of the clip job inside its job
    pub fn index(&self) -> usize {
        self.index
    }

    /// Clip the work applies to
    pub fn clip_id(&self) -> &ClipId {
        &self.clip_id
    }

    /// Reports progress for this clip job
    pub fn report_progress(&self, percent: Percent) {
        self.progress.report(percent);
    }

    /// Checks if cancellation was requested
    pub fn is_canceled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn canceled(&self) {
        let mut rx = self.cancel_rx.clone();
        if rx.wait_for(|canceled| *canceled).await.is_err() {
            // The handle is gone, so nobody can cancel anymore
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Test Support
// =============================================================================
