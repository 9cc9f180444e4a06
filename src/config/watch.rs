use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Long-poll parameters of watch serving.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Chain nodes read per page
    #[serde(default = "default_event_step")]
    pub event_step: usize,

    /// Sleep between rescans when nothing was hit (unit: milliseconds)
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Max time a request is held open (unit: milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Upper bound of `limit` for search operations
    #[serde(default = "default_max_search_limit")]
    pub max_search_limit: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            event_step: default_event_step(),
            loop_interval_ms: default_loop_interval_ms(),
            timeout_ms: default_timeout_ms(),
            max_search_limit: default_max_search_limit(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.event_step == 0 {
            return Err(invalid("watch event_step must be greater than 0".to_string()));
        }
        if self.loop_interval_ms == 0 || self.loop_interval_ms >= self.timeout_ms {
            return Err(invalid(format!(
                "watch loop_interval_ms {} must be in (0, timeout_ms {})",
                self.loop_interval_ms, self.timeout_ms
            )));
        }
        Ok(())
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_event_step() -> usize {
    200
}
fn default_loop_interval_ms() -> u64 {
    250
}
fn default_timeout_ms() -> u64 {
    20_000
}
fn default_max_search_limit() -> usize {
    500
}
