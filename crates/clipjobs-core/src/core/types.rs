//! ClipJobs Core Type Definitions
//!
//! Defines fundamental types used throughout the scheduler.

// =============================================================================
// ID Types
// =============================================================================

/// Clip (bin item) unique identifier
pub type ClipId = String;

/// Job identifier, unique per manager and never reused
pub type JobId = u64;

/// History entry identifier (ULID)
pub type HistoryId = String;

/// Progress value reported by a clip job (percent)
pub type Percent = u32;
