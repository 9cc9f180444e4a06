use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::STORE_ERRORS;
use crate::utils::time::now_secs;
use crate::ArchiveConfig;
use crate::ArchiveStore;
use crate::LeaderObserver;
use crate::Result;

/// Removes archived delete snapshots older than the retention window.
///
/// Runs on the master only, at most once per `run_interval_secs`, deleting
/// in pages with a pause between pages to spare the store.
pub struct ArchiveCleaner {
    archive: Arc<dyn ArchiveStore>,
    leader: Arc<dyn LeaderObserver>,
    config: ArchiveConfig,
    pub(super) last_run: Option<i64>,
}

impl ArchiveCleaner {
    pub fn new(
        archive: Arc<dyn ArchiveStore>,
        leader: Arc<dyn LeaderObserver>,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            archive,
            leader,
            config,
            last_run: None,
        }
    }

    /// Deletes every page of expired documents; returns how many were removed.
    pub async fn clean_once(&self) -> Result<usize> {
        let before = now_secs() - self.config.retention_secs();
        let mut total = 0;
        loop {
            let removed = self.archive.delete_before(before, self.config.page_size).await?;
            total += removed;
            if removed < self.config.page_size {
                break;
            }
            debug!(removed, "archive page cleaned, continue after a pause");
            sleep(self.config.page_sleep()).await;
        }
        Ok(total)
    }

    /// Whether a pass is due at `now`.
    pub fn due(
        &self,
        now: i64,
    ) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now - last >= self.config.run_interval_secs as i64,
        }
    }

    pub async fn run(
        mut self,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        if !self.config.enabled {
            info!("archive cleaner disabled");
            return Ok(());
        }

        let mut ticker = interval(std::time::Duration::from_secs(self.config.check_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    info!("archive cleaner stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let now = now_secs();
                    if !self.leader.is_leader() || !self.due(now) {
                        continue;
                    }
                    match self.clean_once().await {
                        Ok(removed) => {
                            info!(removed, "archive cleaned");
                            self.last_run = Some(now);
                        }
                        Err(e) => {
                            warn!("clean archive failed, retry on next check: {:?}", e);
                            STORE_ERRORS.with_label_values(&["archive", "archive"]).inc();
                        }
                    }
                }
            }
        }
    }
}
