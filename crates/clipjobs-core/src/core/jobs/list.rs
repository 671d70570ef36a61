//! Job List Model
//!
//! Read-only, row oriented view over the registry for list widgets and
//! command line output.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{JobRegistry, JobStatus, JobType};
use crate::core::{JobId, Percent};

/// One row of the job list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRow {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub description: String,
    pub clip_ids: Vec<String>,
    pub progress: Vec<Percent>,
    pub failed: bool,
    /// Registration time (RFC 3339)
    pub created_at: String,
}

/// List view over the registered jobs, one row per job ordered by id
#[derive(Clone, Debug)]
pub struct JobListModel {
    registry: Arc<JobRegistry>,
}

impl JobListModel {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn row_count(&self) -> usize {
        self.registry.len()
    }

    /// Display text of a row: the description of the job's first clip job
    pub fn display_value(&self, row: usize) -> Option<String> {
        let record = self.registry.read().nth(row).cloned()?;
        Some(record.description())
    }

    /// Full row content
    pub fn row(&self, row: usize) -> Option<JobRow> {
        let record = self.registry.read().nth(row).cloned()?;
        Some(JobRow {
            id: record.id(),
            job_type: record.job_type(),
            status: record.status(),
            description: record.description(),
            clip_ids: record.clip_ids().to_vec(),
            progress: record.progress(),
            failed: record.is_failed(),
            created_at: record.created_at().to_string(),
        })
    }

    /// Every row, ordered by job id
    pub fn rows(&self) -> Vec<JobRow> {
        (0..self.row_count()).filter_map(|row| self.row(row)).collect()
    }
}
