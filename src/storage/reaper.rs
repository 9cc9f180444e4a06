use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::CHAIN_NODES_PURGED;
use crate::metrics::STORE_ERRORS;
use crate::ChainStore;
use crate::ClusterTime;
use crate::Key;
use crate::Result;

/// Enforces chain retention: nodes older than their resource ttl are purged.
///
/// This is the only path that deletes chain nodes. Details expire on their
/// own through the cache ttl.
pub struct ChainReaper {
    store: Arc<dyn ChainStore>,
    /// (resource key, tenant) pairs to reap
    chains: Vec<(Key, String)>,
    interval: Duration,
}

impl ChainReaper {
    pub fn new(
        store: Arc<dyn ChainStore>,
        chains: Vec<(Key, String)>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            chains,
            interval,
        }
    }

    /// One pass over every chain; returns the number of purged nodes.
    pub async fn reap_once(&self) -> Result<usize> {
        let now = ClusterTime::now().sec;
        let mut total = 0;
        for (key, tenant) in &self.chains {
            let floor = now.saturating_sub(key.ttl_secs() as u32);
            let chain = key.chain_name(tenant);
            match self.store.purge_expired(&chain, floor).await {
                Ok(n) => {
                    if n > 0 {
                        debug!(chain, purged = n, "purged expired chain nodes");
                        CHAIN_NODES_PURGED.with_label_values(&[key.resource().as_str()]).inc_by(n as u64);
                    }
                    total += n;
                }
                Err(e) => {
                    warn!(chain, "purge expired chain nodes failed: {:?}", e);
                    STORE_ERRORS.with_label_values(&[key.resource().as_str(), "chain"]).inc();
                }
            }
        }
        Ok(total)
    }

    pub async fn run(
        self,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    info!("chain reaper stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.reap_once().await?;
                }
            }
        }
    }
}
