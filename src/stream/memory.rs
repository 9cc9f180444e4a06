use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

use super::ChangeStream;
use super::EventReceiver;
use super::StreamOptions;
use crate::ChangeEvent;
use crate::Result;
use crate::StreamError;

#[derive(Debug, Default)]
struct FeedState {
    log: Vec<ChangeEvent>,
    /// Events before this index are no longer resumable
    retained_from: usize,
    /// Errors handed to the next opened feeds, one each
    pending_errors: VecDeque<StreamError>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<FeedState>,
    notify: Notify,
    watches: AtomicUsize,
}

/// In-process change feed over an append-only event log.
///
/// Resume semantics follow a database change stream: a token resumes
/// strictly after its event, a start time replays events at or after it, and
/// a token that fell out of the retained history is a lost resume point.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeStream {
    inner: Arc<Inner>,
}

impl MemoryChangeStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        event: ChangeEvent,
    ) {
        self.inner.state.lock().log.push(event);
        self.inner.notify.notify_waiters();
    }

    pub fn push_all(
        &self,
        events: impl IntoIterator<Item = ChangeEvent>,
    ) {
        self.inner.state.lock().log.extend(events);
        self.inner.notify.notify_waiters();
    }

    /// Drops the resumable history: tokens of events pushed so far become unknown.
    pub fn expire_history(&self) {
        let mut state = self.inner.state.lock();
        state.retained_from = state.log.len();
    }

    /// The next opened feed yields `err` first and then ends.
    pub fn fail_next_watch(
        &self,
        err: StreamError,
    ) {
        self.inner.state.lock().pending_errors.push_back(err);
    }

    /// Number of feeds opened so far.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.load(Ordering::SeqCst)
    }

    fn start_index(
        state: &FeedState,
        opts: &StreamOptions,
    ) -> std::result::Result<usize, StreamError> {
        if let Some(token) = opts.start_after_token.as_deref().filter(|t| !t.is_empty()) {
            return match state.log.iter().position(|e| e.token == token) {
                Some(i) if i >= state.retained_from => Ok(i + 1),
                _ => Err(StreamError::ResumePointLost(format!(
                    "resume token {token} is not in the retained history"
                ))),
            };
        }
        if let Some(at) = opts.start_at_time.filter(|t| !t.is_zero()) {
            let pos = state
                .log
                .iter()
                .enumerate()
                .skip(state.retained_from)
                .find(|(_, e)| e.cluster_time >= at)
                .map(|(i, _)| i)
                .unwrap_or(state.log.len());
            return Ok(pos);
        }
        Ok(state.log.len())
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn watch(
        &self,
        opts: StreamOptions,
    ) -> Result<EventReceiver> {
        self.inner.watches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(opts.batch_size.max(16));

        let (first_err, start) = {
            let mut state = self.inner.state.lock();
            let first_err = state.pending_errors.pop_front();
            (first_err, Self::start_index(&state, &opts))
        };
        debug!(?opts, ?start, "open memory change stream");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Some(e) = first_err {
                let _ = tx.send(Err(e)).await;
                return;
            }
            let mut idx = match start {
                Ok(i) => i,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            loop {
                let notified = inner.notify.notified();
                let next: Vec<ChangeEvent> = {
                    let state = inner.state.lock();
                    state.log.get(idx..).map(<[ChangeEvent]>::to_vec).unwrap_or_default()
                };

                if next.is_empty() {
                    tokio::select! {
                        _ = notified => continue,
                        _ = tx.closed() => return,
                    }
                }

                idx += next.len();
                for event in next.into_iter().filter(|e| opts.watches(e)) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
