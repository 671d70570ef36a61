//! Job System Module
//!
//! Schedules background clip jobs (proxy generation, transcoding, analysis,
//! ...), runs them once their parent jobs are done, and commits successful
//! results into the undo history.

mod engine;
mod gate;
mod list;
mod manager;
mod record;
mod registry;
mod task;

pub use engine::*;
pub use gate::*;
pub use list::*;
pub use manager::*;
pub use record::*;
pub use registry::*;
pub use task::*;

#[cfg(test)]
pub(crate) use task::testing;

use serde::{Deserialize, Serialize};

// =============================================================================
// Job Types
// =============================================================================

/// Job type enumeration
///
/// Queries take an `Option<JobType>` filter where `None` matches every type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    /// Generate proxy clip for preview
    Proxy,
    /// Extract a zone of a clip
    Cut,
    /// Stabilize footage
    Stabilize,
    /// Transcode to an edit friendly format
    Transcode,
    /// Apply a filter to the whole clip
    FilterClip,
    /// Generate thumbnail images
    Thumbnail,
    /// Analyse clip content (scene cuts, motion, ...)
    AnalyseClip,
    /// Load clip properties
    Load,
    /// Generate audio waveform
    AudioThumbnail,
    /// Create a speed changed copy
    Speed,
    /// Precache frames
    Cache,
}

impl JobType {
    /// Returns true if this type passes the given filter
    pub fn matches(self, filter: Option<JobType>) -> bool {
        filter.map_or(true, |t| t == self)
    }
}

/// Job status, derived from the job's execution handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Waiting for admission
    #[default]
    Pending,
    /// Clip jobs dispatched
    Running,
    /// All clip jobs completed
    Finished,
    /// Cancelled by request
    Canceled,
}

impl JobStatus {
    /// Checks if the job reached a terminal state
    pub fn is_done(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Canceled)
    }
}
