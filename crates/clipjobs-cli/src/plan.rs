//! Job plans
//!
//! A plan is a JSON list of simulated jobs. Each clip job sleeps through its
//! progress steps and, on commit, appends a result to an in-memory clip store
//! with matching undo/redo steps.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clipjobs_core::core::history::push_step;
use clipjobs_core::{ClipJob, HistoryAction, JobContext, JobRequest, JobType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plan loading errors
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid plan JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plan has no jobs")]
    Empty,

    #[error("Duplicate job name: {0}")]
    DuplicateName(String),

    #[error("Job {0} has no clips")]
    NoClips(String),

    #[error("Job {job} depends on {dependency}, which is not declared before it")]
    UnknownDependency { job: String, dependency: String },
}

/// A plan of simulated jobs, started in declaration order
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub jobs: Vec<PlannedJob>,
}

/// One simulated job
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedJob {
    /// Name used by `dependsOn` and `--cancel`
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub clips: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Undo label; empty means no history entry
    #[serde(default)]
    pub label: String,
    /// Progress reports per clip job
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Delay between progress reports
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    /// Clips whose execution fails
    #[serde(default)]
    pub fail_clips: Vec<String>,
    /// Clips whose commit fails
    #[serde(default)]
    pub commit_fail_clips: Vec<String>,
}

fn default_steps() -> u32 {
    4
}

fn default_step_ms() -> u64 {
    25
}

impl Plan {
    /// Reads and validates a plan file
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PlanError> {
        let plan: Plan = serde_json::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Dependencies must name a job declared earlier, which also rules out
    /// cycles.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.jobs.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.clips.is_empty() {
                return Err(PlanError::NoClips(job.name.clone()));
            }
            if let Some(dependency) = job.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(PlanError::UnknownDependency {
                    job: job.name.clone(),
                    dependency: dependency.clone(),
                });
            }
            if !seen.insert(job.name.as_str()) {
                return Err(PlanError::DuplicateName(job.name.clone()));
            }
        }
        Ok(())
    }
}

impl PlannedJob {
    /// Scheduler request for this job, given the ids of its parents
    pub fn request(&self, parents: Vec<u64>) -> JobRequest {
        JobRequest::new(self.job_type, self.clips.clone())
            .with_parents(parents)
            .with_undo_label(self.label.clone())
    }

    /// Clip job for one of this job's clips
    pub fn clip_job(&self, clip_id: &str, store: &ClipStore) -> Arc<dyn ClipJob> {
        Arc::new(SimulatedJob {
            job_name: self.name.clone(),
            job_type: self.job_type,
            clip_id: clip_id.to_string(),
            steps: self.steps,
            step_delay: Duration::from_millis(self.step_ms),
            fail: self.fail_clips.iter().any(|c| c == clip_id),
            commit_fail: self.commit_fail_clips.iter().any(|c| c == clip_id),
            store: store.clone(),
            error: Mutex::new(String::new()),
        })
    }
}

// =============================================================================
// Clip Store
// =============================================================================

/// Results applied to clips, keyed by clip id
#[derive(Clone, Debug, Default)]
pub struct ClipStore {
    results: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
}

impl ClipStore {
    fn apply(&self, clip_id: &str, result: &str) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(clip_id.to_string())
            .or_default()
            .push(result.to_string());
    }

    fn revert(&self, clip_id: &str, result: &str) -> bool {
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = results.get_mut(clip_id) else {
            return false;
        };
        match entries.iter().rposition(|r| r == result) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// =============================================================================
// Simulated Clip Job
// =============================================================================

struct SimulatedJob {
    job_name: String,
    job_type: JobType,
    clip_id: String,
    steps: u32,
    step_delay: Duration,
    fail: bool,
    commit_fail: bool,
    store: ClipStore,
    error: Mutex<String>,
}

impl SimulatedJob {
    fn set_error(&self, message: String) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }
}

#[async_trait]
impl ClipJob for SimulatedJob {
    async fn execute(&self, ctx: &JobContext) -> bool {
        for step in 1..=self.steps {
            tokio::select! {
                _ = tokio::time::sleep(self.step_delay) => {}
                _ = ctx.canceled() => {
                    tracing::debug!("{} on {} stopped", self.job_name, self.clip_id);
                    return false;
                }
            }
            ctx.report_progress(step * 100 / self.steps);
        }

        if self.fail {
            self.set_error(format!("{} could not process {}", self.job_name, self.clip_id));
            return false;
        }
        true
    }

    fn commit_result(&self, undo: &mut HistoryAction, redo: &mut HistoryAction) -> bool {
        if self.commit_fail {
            self.set_error(format!("{} could not apply to {}", self.job_name, self.clip_id));
            return false;
        }

        self.store.apply(&self.clip_id, &self.job_name);

        let (undo_store, redo_store) = (self.store.clone(), self.store.clone());
        let (undo_clip, redo_clip) = (self.clip_id.clone(), self.clip_id.clone());
        let (undo_name, redo_name) = (self.job_name.clone(), self.job_name.clone());
        push_step(
            undo,
            redo,
            move || undo_store.revert(&undo_clip, &undo_name),
            move || {
                redo_store.apply(&redo_clip, &redo_name);
                true
            },
        );
        true
    }

    fn description(&self) -> String {
        format!("{:?} {} on {}", self.job_type, self.job_name, self.clip_id)
    }

    fn error_message(&self) -> String {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
