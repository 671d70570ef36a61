//! ClipJobs Core Engine
//!
//! Scheduler core: job records, dependency admission, parallel execution,
//! undo/redo history integration and settings.

pub mod history;
pub mod jobs;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_scheduling;
