//! Change feed capability and the loop that drives ingestion from it.
//!
//! The source database driver is consumed through [`ChangeStream`]; leadership
//! through [`LeaderObserver`]. [`LoopWatch`] batches raw events and hands them
//! to a [`BatchHandler`], re-watching from the last committed token whenever a
//! batch asks for retry.
mod loop_watch;
mod memory;
pub use loop_watch::*;
pub use memory::*;


use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::ChangeEvent;
use crate::ClusterTime;
use crate::Result;
use crate::StreamError;

/// Where and what to watch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    /// Source collections; empty watches every collection
    pub collections: Vec<String>,
    /// Tenant shard to watch; `None` watches every tenant
    pub tenant_id: Option<String>,
    /// Resume strictly after this native token
    pub start_after_token: Option<String>,
    /// Used when no token is known: first event at or after this time
    pub start_at_time: Option<ClusterTime>,
    /// Hint for the driver's fetch size
    pub batch_size: usize,
}

impl StreamOptions {
    pub fn watches(
        &self,
        event: &ChangeEvent,
    ) -> bool {
        let coll_hit =
            self.collections.is_empty() || self.collections.iter().any(|c| *c == event.collection);
        let tenant_hit = self.tenant_id.as_deref().map_or(true, |t| t == event.tenant_id);
        coll_hit && tenant_hit
    }
}

pub type EventReceiver = mpsc::Receiver<std::result::Result<ChangeEvent, StreamError>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeStream: Send + Sync + 'static {
    /// Opens a feed. Invalidate and resume point loss surface as
    /// [`StreamError`] items; the receiver closes when the feed ends.
    async fn watch(
        &self,
        opts: StreamOptions,
    ) -> Result<EventReceiver>;
}

/// Master election state of this process.
pub trait LeaderObserver: Send + Sync + 'static {
    fn is_leader(&self) -> bool;

    /// Receiver notified on every status change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Leadership flag set by whoever runs the election.
///
/// Holds its own receiver so the channel stays open for the notifier's
/// lifetime.
pub struct LeaderNotifier {
    tx: watch::Sender<bool>,
    _rx: watch::Receiver<bool>,
}

impl LeaderNotifier {
    pub fn new(is_leader: bool) -> Self {
        let (tx, rx) = watch::channel(is_leader);
        Self { tx, _rx: rx }
    }

    pub fn set_leader(
        &self,
        is_leader: bool,
    ) {
        self.tx.send_if_modified(|cur| {
            let changed = *cur != is_leader;
            *cur = is_leader;
            changed
        });
    }
}

impl LeaderObserver for LeaderNotifier {
    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Handles one batch; `true` asks the loop to re-watch from the last
    /// committed token.
    async fn do_batch(
        &self,
        events: Vec<ChangeEvent>,
    ) -> bool;
}
