use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::BatchHandler;
use super::ChangeStream;
use super::EventReceiver;
use super::LeaderObserver;
use super::StreamOptions;
use crate::metrics::alarm;
use crate::metrics::BATCH_DURATION_MS;
use crate::metrics::BATCH_RETRIES;
use crate::ChangeEvent;
use crate::ClusterTime;
use crate::CursorType;
use crate::FlowConfig;
use crate::Result;
use crate::RetryPolicies;
use crate::StreamError;
use crate::TokenHandler;

/// Identity and batching of one loop.
#[derive(Debug, Clone)]
pub struct LoopWatchOptions {
    /// Job name used in logs
    pub name: String,
    pub resource: CursorType,
    pub collections: Vec<String>,
    pub tenant_id: Option<String>,
    pub batch_size: usize,
}

/// Consecutive retries of the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub counter: usize,
    pub max: usize,
}

impl RetryState {
    pub fn new(max: usize) -> Self {
        Self { counter: 0, max }
    }

    /// Counts one more retry; `false` once the budget is spent.
    pub fn can_still_retry(&mut self) -> bool {
        self.counter += 1;
        self.counter <= self.max
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not master: no feed is open
    Standby,
    /// Open a feed from the last committed position and consume it
    Watching,
    /// Wait, then re-watch from the last committed position
    Retrying(Duration),
}

enum Collected {
    Full,
    Tick,
    Shutdown,
    LeaderChanged,
    ResumePointLost(String),
    Broken(StreamError),
}

/// Supervisor of one ingestion flow: `Watching -> Retrying -> Watching`.
///
/// Only the master consumes. Raw events are collected until the batch is full
/// or the flush tick fires, then handed to the [`BatchHandler`]. A batch that
/// asks for retry closes the feed; the next feed resumes from the committed
/// token so the source replays everything not yet durable.
pub struct LoopWatch {
    opts: LoopWatchOptions,
    stream: Arc<dyn ChangeStream>,
    token: TokenHandler,
    handler: Arc<dyn BatchHandler>,
    leader: Arc<dyn LeaderObserver>,
    flow: FlowConfig,
    retry: RetryPolicies,
}

impl LoopWatch {
    pub fn new(
        opts: LoopWatchOptions,
        stream: Arc<dyn ChangeStream>,
        token: TokenHandler,
        handler: Arc<dyn BatchHandler>,
        leader: Arc<dyn LeaderObserver>,
        flow: FlowConfig,
        retry: RetryPolicies,
    ) -> Self {
        Self {
            opts,
            stream,
            token,
            handler,
            leader,
            flow,
            retry,
        }
    }

    pub async fn run(
        self,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        let mut leader_rx = self.leader.subscribe();
        let mut retry_state = RetryState::new(self.retry.batch.max_retries);
        let mut rewatch_attempt = 0;
        let mut state = LoopState::Standby;

        info!(name = %self.opts.name, collections = ?self.opts.collections, "loop watch started");

        loop {
            state = match state {
                LoopState::Standby => {
                    if *leader_rx.borrow_and_update() {
                        LoopState::Watching
                    } else {
                        debug!(name = %self.opts.name, "not master, skip watching");
                        tokio::select! {
                            _ = shutdown_signal.changed() => break,
                            _ = leader_rx.changed() => LoopState::Standby,
                            _ = sleep(self.flow.non_master_sleep()) => LoopState::Standby,
                        }
                    }
                }

                LoopState::Retrying(delay) => {
                    tokio::select! {
                        _ = shutdown_signal.changed() => break,
                        _ = sleep(delay) => LoopState::Watching,
                    }
                }

                LoopState::Watching => match self.open().await {
                    Ok(rx) => {
                        rewatch_attempt = 0;
                        match self
                            .consume(rx, &mut retry_state, &mut leader_rx, &mut shutdown_signal)
                            .await
                        {
                            Some(next) => next,
                            None => break,
                        }
                    }
                    Err(e) => {
                        let delay = self.retry.rewatch.delay_for(rewatch_attempt);
                        rewatch_attempt += 1;
                        error!(name = %self.opts.name, ?delay, "open change stream failed: {:?}", e);
                        LoopState::Retrying(delay)
                    }
                },
            };
        }

        info!(name = %self.opts.name, "loop watch stopped");
        Ok(())
    }

    async fn open(&self) -> Result<EventReceiver> {
        let mut opts = StreamOptions {
            collections: self.opts.collections.clone(),
            tenant_id: self.opts.tenant_id.clone(),
            batch_size: self.opts.batch_size,
            ..Default::default()
        };

        let token = self.token.get_start_watch_token().await?;
        if token.is_empty() {
            let start = self.token.get_start_watch_time().await?;
            if !start.is_zero() {
                opts.start_at_time = Some(start);
            }
        } else {
            opts.start_after_token = Some(token);
        }

        info!(
            name = %self.opts.name,
            token = ?opts.start_after_token,
            start_at = ?opts.start_at_time,
            "watch change stream"
        );
        self.stream.watch(opts).await
    }

    /// Consumes one feed; `None` means shutdown.
    async fn consume(
        &self,
        mut rx: EventReceiver,
        retry_state: &mut RetryState,
        leader_rx: &mut watch::Receiver<bool>,
        shutdown_signal: &mut watch::Receiver<()>,
    ) -> Option<LoopState> {
        let mut ticker = interval(self.flow.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut leader_alive = true;

        loop {
            let mut batch: Vec<ChangeEvent> = Vec::new();
            let collected = loop {
                tokio::select! {
                    _ = shutdown_signal.changed() => break Collected::Shutdown,

                    changed = leader_rx.changed(), if leader_alive => {
                        if changed.is_err() {
                            leader_alive = false;
                            continue;
                        }
                        break Collected::LeaderChanged;
                    }

                    item = rx.recv() => match item {
                        Some(Ok(event)) => {
                            batch.push(event);
                            if batch.len() >= self.opts.batch_size {
                                break Collected::Full;
                            }
                        }
                        Some(Err(StreamError::ResumePointLost(msg))) => {
                            break Collected::ResumePointLost(msg);
                        }
                        Some(Err(e)) => break Collected::Broken(e),
                        None => break Collected::Broken(StreamError::Closed),
                    },

                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            break Collected::Tick;
                        }
                    }
                }
            };

            if let Collected::LeaderChanged = collected {
                // uncommitted events replay from the token after re-watch
                warn!(name = %self.opts.name, "master status has changed, re-watch");
                return Some(LoopState::Standby);
            }

            // in-flight events finish before any other transition
            if !batch.is_empty() && self.handle_batch(batch, retry_state).await {
                let delay = self.retry.batch.delay_for(retry_state.counter.saturating_sub(1));
                return Some(LoopState::Retrying(delay));
            }

            match collected {
                Collected::Full | Collected::Tick => continue,
                Collected::Shutdown => return None,
                Collected::LeaderChanged => return Some(LoopState::Standby),
                Collected::ResumePointLost(msg) => {
                    self.reset_after_fatal(&msg).await;
                    return Some(LoopState::Watching);
                }
                Collected::Broken(e) => {
                    warn!(name = %self.opts.name, "change stream broken, re-watch later: {:?}", e);
                    return Some(LoopState::Retrying(self.retry.rewatch.base_delay()));
                }
            }
        }
    }

    /// Returns whether the feed must be re-opened from the last committed token.
    async fn handle_batch(
        &self,
        batch: Vec<ChangeEvent>,
        retry_state: &mut RetryState,
    ) -> bool {
        let resource = self.opts.resource.as_str();
        let count = batch.len();
        let rid = batch[0].id();
        let first_time = batch[0].cluster_time;
        let last_token = batch[count - 1].token.clone();

        info!(
            name = %self.opts.name,
            count,
            first_op_time = ?first_time,
            rid,
            "received batch events"
        );

        let started = Instant::now();
        let retry = self.handler.do_batch(batch).await;
        BATCH_DURATION_MS
            .with_label_values(&[resource])
            .observe(started.elapsed().as_millis() as f64);

        if retry {
            if retry_state.can_still_retry() {
                warn!(name = %self.opts.name, count, rid, "do batch failed, retry now");
                BATCH_RETRIES.with_label_values(&[resource]).inc();
                return true;
            }
            warn!(name = %self.opts.name, rid, "batch retry exceed max count, skip");
        }
        retry_state.reset();

        if let Err(e) = self.token.set_last_watch_token(&last_token).await {
            error!(name = %self.opts.name, rid, "set last watch token failed, retry later: {:?}", e);
            return true;
        }
        false
    }

    /// Restarts from `now - margin`, knowingly skipping what the source lost.
    async fn reset_after_fatal(
        &self,
        msg: &str,
    ) {
        let now = ClusterTime::now();
        let start_at = ClusterTime::new(now.sec.saturating_sub(self.flow.fatal_reset_margin_secs), 0);
        error!(
            name = %self.opts.name,
            start_at = start_at.sec,
            "change stream lost its resume point: {msg}"
        );
        alarm(self.opts.resource.as_str(), "resume_point_lost");
        if let Err(e) = self.token.reset_watch_token(start_at).await {
            error!(name = %self.opts.name, "reset watch token failed: {:?}", e);
        }
    }
}
