use std::sync::Arc;

use tracing::error;
use tracing::info;
use tracing::warn;

use crate::metrics::alarm;
use crate::metrics::CURSOR_CONFLICTS;
use crate::metrics::EVENTS_INGESTED;
use crate::metrics::STORE_ERRORS;
use crate::ChainNode;
use crate::ChainStore;
use crate::CursorType;
use crate::Result;
use crate::WatchToken;
use crate::CURSOR_INDEX;
use crate::ID_INDEX;

/// Bound on id reassignments after duplicate id rejections.
const MAX_ID_CORRECTIONS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Nodes written, with their final ids
    Committed(Vec<ChainNode>),
    /// A single conflicting node was left: nothing written, no retry
    GaveUp,
    /// Transient failure: re-watch from the last committed token
    Retry,
}

/// Writes chain nodes and the token record of one flow in one atomic unit,
/// resolving duplicate cursor conflicts by reduce-and-retry.
#[derive(Clone)]
pub struct ChainCommitter {
    resource: CursorType,
    chain: String,
    sequence: String,
    token_key: String,
    store: Arc<dyn ChainStore>,
}

impl ChainCommitter {
    pub fn new(
        resource: CursorType,
        chain: String,
        sequence: String,
        token_key: String,
        store: Arc<dyn ChainStore>,
    ) -> Self {
        Self {
            resource,
            chain,
            sequence,
            token_key,
            store,
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// Appends `nodes` with the token of the batch's last raw event.
    ///
    /// On a duplicate cursor the conflicting node named by the store error is
    /// removed and the rest retried. When no node can be identified the oldest
    /// one is dropped, which may lose that event. Ids not above the chain tail
    /// are reassigned before each retry so ids keep increasing.
    pub async fn insert(
        &self,
        mut nodes: Vec<ChainNode>,
        token: WatchToken,
        rid: &str,
    ) -> CommitOutcome {
        let resource = self.resource.as_str();
        let mut id_corrections = 0;

        loop {
            let Some(last) = nodes.last() else {
                return CommitOutcome::Committed(nodes);
            };
            let record = WatchToken {
                token: token.token.clone(),
                start_at_time: last.cluster_time,
                id: last.id,
                cursor: last.cursor.clone(),
            };

            let err = match self.store.append(&self.chain, nodes.clone(), &self.token_key, record).await {
                Ok(()) => {
                    EVENTS_INGESTED.with_label_values(&[resource]).inc_by(nodes.len() as u64);
                    return CommitOutcome::Committed(nodes);
                }
                Err(e) => e,
            };

            let Some(msg) = err.duplicate_key_message().map(str::to_string) else {
                error!(chain = %self.chain, rid, "insert chain nodes failed: {:?}", err);
                STORE_ERRORS.with_label_values(&[resource, "chain"]).inc();
                return CommitOutcome::Retry;
            };

            if msg.contains(CURSOR_INDEX) {
                alarm(resource, "retry_conflict_nodes");
                if nodes.len() <= 1 {
                    warn!(chain = %self.chain, rid, "conflict on the only node left, give up: {msg}");
                    return CommitOutcome::GaveUp;
                }

                match nodes.iter().position(|n| msg.contains(n.cursor.as_str())) {
                    Some(index) => {
                        CURSOR_CONFLICTS.with_label_values(&[resource, "commit"]).inc();
                        let reduced = nodes.remove(index);
                        warn!(
                            chain = %self.chain,
                            rid,
                            cursor = %reduced.cursor,
                            remain = nodes.len(),
                            "insert with reduced conflicting node"
                        );
                    }
                    None => {
                        let dropped = nodes.remove(0);
                        warn!(
                            chain = %self.chain,
                            rid,
                            cursor = %dropped.cursor,
                            remain = nodes.len(),
                            "conflicting node not identified, drop the oldest one"
                        );
                    }
                }

                if let Err(e) = self.correct_ids(&mut nodes, false).await {
                    error!(chain = %self.chain, rid, "correct chain node ids failed: {:?}", e);
                    return CommitOutcome::Retry;
                }
                continue;
            }

            if msg.contains(ID_INDEX) && id_corrections < MAX_ID_CORRECTIONS {
                id_corrections += 1;
                info!(chain = %self.chain, rid, "chain node id taken by another writer, reassign ids");
                if let Err(e) = self.correct_ids(&mut nodes, true).await {
                    error!(chain = %self.chain, rid, "correct chain node ids failed: {:?}", e);
                    return CommitOutcome::Retry;
                }
                continue;
            }

            error!(chain = %self.chain, rid, "unresolvable duplicate key: {msg}");
            return CommitOutcome::Retry;
        }
    }

    /// Reassigns ids from the sequence when any of them is not above the tail.
    async fn correct_ids(
        &self,
        nodes: &mut [ChainNode],
        force: bool,
    ) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let tail_id = self.store.tail(&self.chain).await?.map(|n| n.id).unwrap_or(0);
        let stale = nodes.iter().any(|n| n.id <= tail_id);
        if !stale && !force {
            return Ok(());
        }

        let ids = self.store.next_sequences(&self.sequence, nodes.len()).await?;
        for (node, id) in nodes.iter_mut().zip(ids) {
            node.id = id;
        }
        Ok(())
    }
}

/// Keeps the last node of every cursor, preserving the original order.
pub fn rearrange_events(nodes: Vec<ChainNode>) -> Vec<ChainNode> {
    let mut seen = std::collections::HashSet::new();
    let mut picked: Vec<ChainNode> = nodes
        .into_iter()
        .rev()
        .filter(|n| seen.insert(n.cursor.clone()))
        .collect();
    picked.reverse();
    picked
}
