use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Retention of the delete archive, enforced by the leader only.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Archived documents older than this are removed (unit: days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Documents removed per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pause between pages (unit: milliseconds)
    #[serde(default = "default_page_sleep_ms")]
    pub page_sleep_ms: u64,

    /// Minimum time between two cleanup runs (unit: seconds)
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,

    /// How often the cleaner wakes to check whether a run is due (unit: seconds)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            retention_days: default_retention_days(),
            page_size: default_page_size(),
            page_sleep_ms: default_page_sleep_ms(),
            run_interval_secs: default_run_interval_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.retention_days == 0 {
            return Err(invalid("archive retention_days must be greater than 0".to_string()));
        }
        if self.page_size == 0 {
            return Err(invalid("archive page_size must be greater than 0".to_string()));
        }
        if self.check_interval_secs == 0 {
            return Err(invalid(
                "archive check_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention_secs(&self) -> i64 {
        (self.retention_days * 24 * 3600) as i64
    }

    pub fn page_sleep(&self) -> Duration {
        Duration::from_millis(self.page_sleep_ms)
    }
}

fn default_enabled() -> bool {
    true
}
fn default_retention_days() -> u64 {
    7
}
fn default_page_size() -> usize {
    1000
}
fn default_page_sleep_ms() -> u64 {
    1000
}
fn default_run_interval_secs() -> u64 {
    24 * 3600
}
fn default_check_interval_secs() -> u64 {
    3600
}
