use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Maximum number of retries before the work is skipped
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay before each retry (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Exponential delay of the n-th retry, capped at `max_delay_ms`.
    pub fn delay_for(
        &self,
        attempt: usize,
    ) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16) as u32).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Divide strategies by concern
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    // Re-watch after a batch asked for retry
    #[serde(default)]
    pub batch: BackoffPolicy,

    // Re-open the change feed after a source failure
    #[serde(default)]
    pub rewatch: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            batch: BackoffPolicy {
                max_retries: 10,
                base_delay_ms: 1000,
                max_delay_ms: 1000,
            },
            rewatch: BackoffPolicy {
                max_retries: 0,
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
            },
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [("batch", &self.batch), ("rewatch", &self.rewatch)] {
            if p.base_delay_ms > p.max_delay_ms {
                return Err(invalid(format!(
                    "retry.{name}: base_delay_ms {} exceeds max_delay_ms {}",
                    p.base_delay_ms, p.max_delay_ms
                )));
            }
        }
        if self.batch.max_retries == 0 {
            return Err(invalid("retry.batch.max_retries must be greater than 0".to_string()));
        }
        Ok(())
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
