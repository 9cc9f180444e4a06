use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Ingestion loop parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FlowConfig {
    /// Max raw events per batch of a plain resource flow
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Max raw events per batch of a mix resource flow
    #[serde(default = "default_mix_batch_size")]
    pub mix_batch_size: usize,

    /// Cursors remembered across batches to drop replayed events
    #[serde(default = "default_cursor_queue_size")]
    pub cursor_queue_size: usize,

    /// A partial batch is flushed after this tick (unit: milliseconds)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Pause between master checks on a non master node (unit: milliseconds)
    #[serde(default = "default_non_master_sleep_ms")]
    pub non_master_sleep_ms: u64,

    /// On resume point loss, restart the feed this far in the past (unit: seconds)
    #[serde(default = "default_fatal_reset_margin_secs")]
    pub fatal_reset_margin_secs: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            mix_batch_size: default_mix_batch_size(),
            cursor_queue_size: default_cursor_queue_size(),
            flush_interval_ms: default_flush_interval_ms(),
            non_master_sleep_ms: default_non_master_sleep_ms(),
            fatal_reset_margin_secs: default_fatal_reset_margin_secs(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.mix_batch_size == 0 {
            return Err(invalid("flow batch sizes must be greater than 0".to_string()));
        }
        if self.cursor_queue_size < self.batch_size.max(self.mix_batch_size) {
            return Err(invalid(format!(
                "cursor_queue_size {} must hold at least one batch",
                self.cursor_queue_size
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("flush_interval_ms must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn non_master_sleep(&self) -> Duration {
        Duration::from_millis(self.non_master_sleep_ms)
    }
}

fn default_batch_size() -> usize {
    200
}
fn default_mix_batch_size() -> usize {
    500
}
fn default_cursor_queue_size() -> usize {
    50_000
}
fn default_flush_interval_ms() -> u64 {
    50
}
fn default_non_master_sleep_ms() -> u64 {
    5000
}
fn default_fatal_reset_margin_secs() -> u32 {
    60
}
