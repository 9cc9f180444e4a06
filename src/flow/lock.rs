use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::DetailCache;
use crate::Result;
use crate::SystemError;

/// Cache backed mutual exclusion around id assignment of one chain.
///
/// Acquisition polls `SET NX` every `retry_interval` until `ttl` elapses. The
/// lock value is unique per acquisition, so a holder whose ttl expired never
/// releases a lock taken over by another writer.
#[derive(Clone)]
pub struct SequenceLock {
    key: String,
    ttl: Duration,
    retry_interval: Duration,
    cache: Arc<dyn DetailCache>,
}

/// Proof of acquisition, consumed by [`SequenceLock::release`].
#[derive(Debug)]
#[must_use]
pub struct LockGuard {
    value: String,
}

impl SequenceLock {
    pub fn new(
        key: String,
        ttl: Duration,
        retry_interval: Duration,
        cache: Arc<dyn DetailCache>,
    ) -> Self {
        Self {
            key,
            ttl,
            retry_interval,
            cache,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn acquire(
        &self,
        rid: &str,
    ) -> Result<LockGuard> {
        let value = nanoid::nanoid!();
        let started = Instant::now();

        loop {
            if self.cache.set_nx(&self.key, value.clone(), self.ttl).await? {
                debug!(key = %self.key, rid, "sequence lock acquired");
                return Ok(LockGuard { value });
            }

            let waited = started.elapsed();
            if waited + self.retry_interval > self.ttl {
                return Err(SystemError::LockTimeout {
                    key: self.key.clone(),
                    waited,
                }
                .into());
            }
            trace!(key = %self.key, rid, "sequence lock is held, retry later");
            sleep(self.retry_interval).await;
        }
    }

    /// Deletes the lock if it still holds this acquisition's value.
    pub async fn release(
        &self,
        guard: LockGuard,
        rid: &str,
    ) {
        match self.cache.get(&self.key).await {
            Ok(Some(v)) if v == guard.value => {
                if let Err(e) = self.cache.del(&self.key).await {
                    error!(key = %self.key, rid, "release sequence lock failed: {:?}", e);
                }
            }
            Ok(_) => debug!(key = %self.key, rid, "sequence lock expired before release"),
            Err(e) => error!(key = %self.key, rid, "read sequence lock failed: {:?}", e),
        }
    }
}
