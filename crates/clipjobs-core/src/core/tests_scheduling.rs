//! Scheduling Scenario Tests
//!
//! End to end behavior of the job manager: dependency ordering, commit into
//! the history, failure and cancellation bookkeeping, and terminal handler
//! idempotence under racing notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::history::UndoStack;
use crate::core::jobs::testing::{event_log, position, EventLog, ScriptedJob};
use crate::core::jobs::{
    ClipJob, ItemModel, JobEvent, JobManager, JobRequest, JobStatus, JobType, RunState,
    WorkerPoolConfig,
};
use crate::core::{ClipId, JobId};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Item model counting notifications per clip
#[derive(Default)]
struct RecordingItems {
    updates: Mutex<HashMap<ClipId, usize>>,
}

impl RecordingItems {
    fn count(&self, clip_id: &str) -> usize {
        self.updates
            .lock()
            .unwrap()
            .get(clip_id)
            .copied()
            .unwrap_or(0)
    }
}

impl ItemModel for RecordingItems {
    fn on_item_updated(&self, clip_id: &ClipId) {
        *self
            .updates
            .lock()
            .unwrap()
            .entry(clip_id.clone())
            .or_default() += 1;
    }
}

struct Harness {
    manager: JobManager,
    history: Arc<UndoStack>,
    items: Arc<RecordingItems>,
    log: EventLog,
}

fn harness(num_workers: usize) -> Harness {
    let history = Arc::new(UndoStack::new());
    let items = Arc::new(RecordingItems::default());
    let manager = JobManager::new(
        WorkerPoolConfig { num_workers },
        items.clone(),
        history.clone(),
    )
    .unwrap();
    Harness {
        manager,
        history,
        items,
        log: event_log(),
    }
}

fn job(task: ScriptedJob) -> Arc<dyn ClipJob> {
    Arc::new(task)
}

impl Harness {
    /// Starts a job of default scripted clip jobs
    fn start(&self, request: JobRequest) -> JobId {
        let log = self.log.clone();
        self.manager
            .start_job(request, |clip| job(ScriptedJob::new(clip, &log)))
            .unwrap()
    }

    async fn wait(&self, job_id: JobId) -> JobStatus {
        tokio::time::timeout(TIMEOUT, self.manager.wait_for_job(job_id))
            .await
            .expect("job did not complete in time")
            .unwrap()
    }

    async fn wait_for_count(&self, expected: usize) {
        let mut rx = self.manager.subscribe_job_count();
        tokio::time::timeout(TIMEOUT, rx.wait_for(|count| *count == expected))
            .await
            .expect("job count not reached")
            .unwrap();
    }
}

// =============================================================================
// Success Path
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_job_commits_one_history_entry() {
    let h = harness(2);
    let job_id = h.start(
        JobRequest::new(JobType::Proxy, ["clip_a", "clip_b"]).with_undo_label("Create proxy"),
    );

    assert_eq!(h.wait(job_id).await, JobStatus::Finished);
    assert!(!h.manager.is_job_failed(job_id).unwrap());
    assert_eq!(h.history.undo_count(), 1);
    assert_eq!(h.history.last_label().as_deref(), Some("Create proxy"));
    assert_eq!(h.manager.job_progress_for_clip(job_id, "clip_a").unwrap(), 100);
    assert_eq!(
        h.manager.finished_job_ids("clip_b", None).unwrap(),
        vec![job_id]
    );
    assert!(!h.manager.has_pending_job("clip_a", None).unwrap());

    // Undo replays the clip jobs' steps newest first
    assert_eq!(h.history.undo().unwrap(), "Create proxy");
    let undo_b = position(&h.log, "undo:clip_b").unwrap();
    let undo_a = position(&h.log, "undo:clip_a").unwrap();
    assert!(undo_b < undo_a);

    h.wait_for_count(0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_label_skips_history() {
    let h = harness(2);
    let commits = Arc::new(AtomicUsize::new(0));
    let log = h.log.clone();
    let job_id = h
        .manager
        .start_job(JobRequest::new(JobType::Load, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).with_commit_counter(&commits))
        })
        .unwrap();

    assert_eq!(h.wait(job_id).await, JobStatus::Finished);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(h.history.undo_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_never_decreases() {
    let h = harness(1);
    let log = h.log.clone();
    let job_id = h
        .manager
        .start_job(JobRequest::new(JobType::Cache, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).with_steps(&[30, 10, 80, 40]))
        })
        .unwrap();

    h.wait(job_id).await;
    assert_eq!(h.manager.job_progress_for_clip(job_id, "clip_a").unwrap(), 80);
    // One notification per progress report plus the terminal one
    assert_eq!(h.items.count("clip_a"), 5);
}

// =============================================================================
// Dependencies
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_child_starts_after_parent_is_done() {
    let h = harness(4);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let parent = h
        .manager
        .start_job(JobRequest::new(JobType::Transcode, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&hold))
        })
        .unwrap();
    let child = h.start(JobRequest::new(JobType::AnalyseClip, ["clip_b"]).with_parents([parent]));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.job_status(parent).unwrap(), JobStatus::Running);
    assert_eq!(h.manager.job_status(child).unwrap(), JobStatus::Pending);
    assert!(position(&h.log, "start:clip_b").is_none());

    hold.notify_one();
    assert_eq!(h.wait(child).await, JobStatus::Finished);

    let parent_end = position(&h.log, "end:clip_a").unwrap();
    let child_start = position(&h.log, "start:clip_b").unwrap();
    assert!(parent_end < child_start);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_child_waits_for_every_parent() {
    let h = harness(4);
    let first_hold = Arc::new(Notify::new());
    let second_hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let first = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&first_hold))
        })
        .unwrap();
    let second = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_b"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&second_hold))
        })
        .unwrap();
    let child = h.start(
        JobRequest::new(JobType::Stabilize, ["clip_a", "clip_b"]).with_parents([first, second]),
    );

    // Second parent done first, child still waits for the first one
    second_hold.notify_one();
    h.wait(second).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.job_status(child).unwrap(), JobStatus::Pending);

    first_hold.notify_one();
    assert_eq!(h.wait(child).await, JobStatus::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_canceled_parent_still_admits_child() {
    let h = harness(2);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let parent = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&hold))
        })
        .unwrap();
    let child = h.start(JobRequest::new(JobType::Thumbnail, ["clip_a"]).with_parents([parent]));

    h.manager.discard_jobs("clip_a", Some(JobType::Proxy));
    assert_eq!(h.wait(parent).await, JobStatus::Canceled);
    assert_eq!(h.wait(child).await, JobStatus::Finished);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_execution_failure_skips_commit() {
    let mut h = harness(2);
    let mut events = h.manager.take_event_receiver().unwrap();
    let commits = Arc::new(AtomicUsize::new(0));
    let log = h.log.clone();

    let job_id = h
        .manager
        .start_job(
            JobRequest::new(JobType::Transcode, ["clip_a", "clip_b"]).with_undo_label("Transcode"),
            |clip| {
                let task = ScriptedJob::new(clip, &log).with_commit_counter(&commits);
                if clip == "clip_b" {
                    job(task.failing())
                } else {
                    job(task)
                }
            },
        )
        .unwrap();

    assert_eq!(h.wait(job_id).await, JobStatus::Finished);
    // `failed` is reserved for commit failures
    assert!(!h.manager.is_job_failed(job_id).unwrap());
    assert!(!h.manager.list_model().row(0).unwrap().failed);
    assert_eq!(commits.load(Ordering::SeqCst), 0);
    assert_eq!(h.history.undo_count(), 0);
    assert_eq!(
        h.manager.job_message_for_clip(job_id, "clip_b").unwrap(),
        "Cannot process clip_b"
    );

    let mut failure = None;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::ExecutionFailed { job_id: id, error } = event {
            failure = Some((id, error));
        }
    }
    let (id, error) = failure.unwrap();
    assert_eq!(id, job_id);
    assert!(error.contains("Cannot process clip_b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_failure_marks_failed_without_history() {
    let h = harness(2);
    let log = h.log.clone();
    let job_id = h
        .manager
        .start_job(
            JobRequest::new(JobType::Cut, ["clip_a", "clip_b"]).with_undo_label("Cut"),
            |clip| {
                let task = ScriptedJob::new(clip, &log);
                if clip == "clip_b" {
                    job(task.commit_failing())
                } else {
                    job(task)
                }
            },
        )
        .unwrap();

    h.wait(job_id).await;
    assert!(h.manager.is_job_failed(job_id).unwrap());
    assert_eq!(h.history.undo_count(), 0);
    // Earlier commits of the job stay applied
    assert!(position(&h.log, "commit:clip_a").is_some());
    assert!(position(&h.log, "commit:clip_b").is_some());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_job_is_never_failed() {
    let h = harness(2);
    let hold = Arc::new(Notify::new());
    let commits = Arc::new(AtomicUsize::new(0));
    let log = h.log.clone();

    let job_id = h
        .manager
        .start_job(
            JobRequest::new(JobType::Stabilize, ["clip_a"]).with_undo_label("Stabilize"),
            |clip| {
                job(ScriptedJob::new(clip, &log)
                    .held_by(&hold)
                    .with_commit_counter(&commits))
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.manager.discard_clip_jobs("clip_a").unwrap();

    assert_eq!(h.wait(job_id).await, JobStatus::Canceled);
    assert!(!h.manager.is_job_failed(job_id).unwrap());
    assert_eq!(h.history.undo_count(), 0);

    // The clip job winds down without turning the job finished
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(position(&h.log, "canceled:clip_a").is_some());
    assert_eq!(h.manager.job_status(job_id).unwrap(), JobStatus::Canceled);
    assert_eq!(commits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_before_admission_never_runs() {
    let h = harness(2);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let parent = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&hold))
        })
        .unwrap();
    let child = h.start(
        JobRequest::new(JobType::Speed, ["clip_b"])
            .with_parents([parent])
            .with_undo_label("Change speed"),
    );

    // Parent dispatched, child still waiting for it
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.manager.cancel_pending();
    assert_eq!(h.wait(child).await, JobStatus::Canceled);
    assert_eq!(h.manager.job_status(parent).unwrap(), JobStatus::Running);
    assert!(h.manager.pending_job_ids("clip_b", None).unwrap().is_empty());
    assert_eq!(h.manager.finished_job_ids("clip_b", None).unwrap(), vec![child]);
    assert!(!h.manager.is_job_failed(child).unwrap());

    hold.notify_one();
    assert_eq!(h.wait(parent).await, JobStatus::Finished);
    assert!(position(&h.log, "start:clip_b").is_none());
    assert_eq!(h.history.undo_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discard_only_cancels_matching_type() {
    let h = harness(2);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();
    let held = |clip: &ClipId| job(ScriptedJob::new(clip, &log).held_by(&hold));

    let proxy = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a"]), held)
        .unwrap();
    let audio = h
        .manager
        .start_job(JobRequest::new(JobType::AudioThumbnail, ["clip_a"]), held)
        .unwrap();
    let other = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_b"]), held)
        .unwrap();

    h.manager.discard_jobs("clip_a", Some(JobType::Proxy));
    h.manager.discard_jobs("unknown_clip", None);

    assert_eq!(h.wait(proxy).await, JobStatus::Canceled);
    assert!(!h.manager.job_status(audio).unwrap().is_done());
    assert!(!h.manager.job_status(other).unwrap().is_done());
    assert_eq!(
        h.manager.pending_job_ids("clip_a", None).unwrap(),
        vec![audio]
    );

    h.manager.cancel_all();
    assert_eq!(h.wait(audio).await, JobStatus::Canceled);
    assert_eq!(h.wait(other).await, JobStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_cancels_every_job() {
    let h = harness(1);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();
    h.manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&hold))
        })
        .unwrap();
    let list = h.manager.list_model();

    drop(h.manager);
    let row = list.row(0).unwrap();
    assert_eq!(row.status, JobStatus::Canceled);
}

// =============================================================================
// Terminal Handlers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_terminal_handlers_run_once() {
    let h = harness(2);
    let hold = Arc::new(Notify::new());
    let commits = Arc::new(AtomicUsize::new(0));
    let log = h.log.clone();

    let job_id = h
        .manager
        .start_job(
            JobRequest::new(JobType::FilterClip, ["clip_a"]).with_undo_label("Filter"),
            |clip| {
                job(ScriptedJob::new(clip, &log)
                    .with_steps(&[])
                    .held_by(&hold)
                    .with_commit_counter(&commits))
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handler = Arc::new(h.manager.terminal_handler());
    let threads: Vec<_> = [RunState::Finished, RunState::Canceled, RunState::Finished]
        .into_iter()
        .map(|state| {
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || (*handler)(job_id, state))
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    h.wait(job_id).await;
    assert_eq!(h.items.count("clip_a"), 1);

    // The real completion arrives later and is ignored
    hold.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.items.count("clip_a"), 1);
    assert_eq!(commits.load(Ordering::SeqCst), 0);
    assert_eq!(h.history.undo_count(), 0);
}

// =============================================================================
// Queries and Counters
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_and_finished_partition_clip_jobs() {
    let h = harness(2);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let done = h.start(JobRequest::new(JobType::Load, ["clip_a"]));
    h.wait(done).await;
    let running = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&hold))
        })
        .unwrap();
    let waiting = h.start(JobRequest::new(JobType::Transcode, ["clip_a"]).with_parents([running]));

    let mut pending = h.manager.pending_job_ids("clip_a", None).unwrap();
    let finished = h.manager.finished_job_ids("clip_a", None).unwrap();
    assert_eq!(pending, vec![running, waiting]);
    assert_eq!(finished, vec![done]);

    pending.extend(finished);
    pending.sort_unstable();
    assert_eq!(pending, h.manager.job_ids());
    assert_eq!(
        h.manager.find_pending_job("clip_a", Some(JobType::Transcode)).unwrap(),
        Some(waiting)
    );

    hold.notify_one();
    h.wait(waiting).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_count_tracks_ready_results() {
    let h = harness(4);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let slow = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a", "clip_b"]), |clip| {
            if clip == "clip_b" {
                job(ScriptedJob::new(clip, &log).held_by(&hold))
            } else {
                job(ScriptedJob::new(clip, &log))
            }
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Any transition recomputes the count; clip_a's result is ready
    let quick = h.start(JobRequest::new(JobType::Load, ["clip_c"]));
    h.wait(quick).await;
    h.wait_for_count(1).await;

    hold.notify_one();
    h.wait(slow).await;
    h.wait_for_count(0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_bounds_running_clip_jobs() {
    let h = harness(1);
    let hold = Arc::new(Notify::new());
    let log = h.log.clone();

    let job_id = h
        .manager
        .start_job(JobRequest::new(JobType::Proxy, ["clip_a", "clip_b"]), |clip| {
            job(ScriptedJob::new(clip, &log).held_by(&hold))
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.num_workers(), 1);
    assert_eq!(h.log.lock().unwrap().len(), 1);

    hold.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    hold.notify_one();
    assert_eq!(h.wait(job_id).await, JobStatus::Finished);
}
