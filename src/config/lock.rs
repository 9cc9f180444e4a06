use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Sequence lock taken by mix flows around id assignment.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    /// Lock expiry, also the max time spent acquiring it (unit: milliseconds)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Pause between acquire attempts (unit: milliseconds)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Host identity flows contend harder and poll faster (unit: milliseconds)
    #[serde(default = "default_host_identity_ttl_ms")]
    pub host_identity_ttl_ms: u64,

    #[serde(default = "default_host_identity_retry_interval_ms")]
    pub host_identity_retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            host_identity_ttl_ms: default_host_identity_ttl_ms(),
            host_identity_retry_interval_ms: default_host_identity_retry_interval_ms(),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval_ms == 0 || self.retry_interval_ms > self.ttl_ms {
            return Err(invalid(format!(
                "lock retry_interval_ms {} must be in (0, ttl_ms {}]",
                self.retry_interval_ms, self.ttl_ms
            )));
        }
        if self.host_identity_retry_interval_ms == 0
            || self.host_identity_retry_interval_ms > self.host_identity_ttl_ms
        {
            return Err(invalid(
                "lock host_identity_retry_interval_ms must be in (0, host_identity_ttl_ms]"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// (ttl, retry interval) for the given mix resource.
    pub fn timing(
        &self,
        host_identity: bool,
    ) -> (Duration, Duration) {
        if host_identity {
            (
                Duration::from_millis(self.host_identity_ttl_ms),
                Duration::from_millis(self.host_identity_retry_interval_ms),
            )
        } else {
            (
                Duration::from_millis(self.ttl_ms),
                Duration::from_millis(self.retry_interval_ms),
            )
        }
    }
}

fn default_ttl_ms() -> u64 {
    10_000
}
fn default_retry_interval_ms() -> u64 {
    300
}
fn default_host_identity_ttl_ms() -> u64 {
    60_000
}
fn default_host_identity_retry_interval_ms() -> u64 {
    100
}
