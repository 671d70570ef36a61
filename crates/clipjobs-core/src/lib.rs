//! ClipJobs - Background job scheduling for clip processing
//!
//! Jobs group one clip job per clip, may depend on earlier jobs, run in
//! parallel on a bounded worker pool and commit their results into an
//! undo/redo history.

use std::path::Path;
use std::sync::OnceLock;

pub mod core;

pub use crate::core::history::{HistoryAction, HistorySink, UndoStack};
pub use crate::core::jobs::{
    ClipJob, ItemModel, JobContext, JobEvent, JobListModel, JobManager, JobRequest, JobRow,
    JobStatus, JobType, NoopItemModel, WorkerPoolConfig,
};
pub use crate::core::settings::SchedulerSettings;
pub use crate::core::{ClipId, CoreError, CoreResult, JobId};

/// Keeps the non-blocking file writer alive for the whole process
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the global tracing subscriber.
///
/// Logs go to stdout and, when `log_dir` is given, to a daily rolling file
/// in that directory. The filter comes from `RUST_LOG` with INFO as the
/// default level. Calling it again is a no-op.
pub fn init_logging(log_dir: Option<&Path>) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = log_dir.and_then(|dir| {
        // Best effort: without a directory we only log to stdout
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Cannot create log directory {}: {}", dir.display(), e);
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(dir, "clipjobs.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        if LOG_GUARD.set(guard).is_err() {
            return None;
        }
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    // Avoid panics if already initialized (tests, repeated calls).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
