//! Scheduler Settings
//!
//! Persistent scheduler configuration with:
//! - Atomic file writes (temp file + rename)
//! - Defaults for missing fields
//! - Normalization of out-of-range values
//!
//! Storage location: {config_dir}/clipjobs/settings.json

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::jobs::WorkerPoolConfig;
use crate::core::CoreResult;

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Upper bound for the worker count
pub const MAX_WORKERS: usize = 64;

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Clip jobs allowed to run at once (0 = number of CPUs)
    #[serde(default)]
    pub worker_count: usize,

    /// Undo entries kept in memory
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,

    /// Directory for rolling log files; no file logging when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_max_history_size() -> usize {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            worker_count: 0,
            max_history_size: default_max_history_size(),
            log_dir: None,
        }
    }
}

impl SchedulerSettings {
    /// Corrects bad values instead of failing, so an old or hand edited
    /// file still loads.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        // 0 means "auto".
        self.worker_count = self.worker_count.min(MAX_WORKERS);
        self.max_history_size = self.max_history_size.clamp(1, 1000);
        if self
            .log_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            self.log_dir = None;
        }
    }

    /// Effective number of workers
    pub fn effective_workers(&self) -> usize {
        if self.worker_count == 0 {
            WorkerPoolConfig::default().num_workers
        } else {
            self.worker_count
        }
    }

    /// Execution engine configuration
    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers: self.effective_workers(),
        }
    }

    /// Loads settings from disk.
    ///
    /// A missing file yields defaults; an unreadable or corrupted one is
    /// logged and yields defaults too.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("Settings file not found, using defaults");
            return Self::default();
        }

        let result = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings file: {}", e))
            .and_then(|content| {
                serde_json::from_str::<SchedulerSettings>(&content)
                    .map_err(|e| format!("Failed to parse settings file: {}", e))
            });

        match result {
            Ok(mut settings) => {
                if settings.version < SETTINGS_VERSION {
                    info!(
                        "Migrating settings from version {} to {}",
                        settings.version, SETTINGS_VERSION
                    );
                }
                settings.normalize();
                settings
            }
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Saves normalized settings using an atomic write (temp file + rename)
    /// and returns what was written.
    pub fn save(&self, path: &Path) -> CoreResult<Self> {
        let mut normalized = self.clone();
        normalized.normalize();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(&normalized)?;

        let temp_path = path.with_extension("json.tmp");
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        info!("Settings saved to {:?}", path);
        Ok(normalized)
    }
}
