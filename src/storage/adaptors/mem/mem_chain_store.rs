use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::trace;

use crate::duplicate_cursor_message;
use crate::duplicate_id_message;
use crate::owns_token;
use crate::ChainNode;
use crate::ChainStore;
use crate::ClusterTime;
use crate::NodeFilter;
use crate::Result;
use crate::StorageError;
use crate::WatchToken;

#[derive(Debug, Default)]
struct Chain {
    nodes: BTreeMap<u64, ChainNode>,
    /// Unique cursor index
    cursors: HashMap<String, u64>,
    /// Highest id ever appended; purges never lower it
    max_id: u64,
}

/// In-memory chain store.
///
/// A single write lock over all chains and tokens makes `append` atomic.
#[derive(Debug, Default)]
pub struct MemChainStore {
    chains: RwLock<HashMap<String, Chain>>,
    tokens: RwLock<HashMap<String, WatchToken>>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl MemChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in a chain, expired ones included.
    pub fn len(
        &self,
        chain: &str,
    ) -> usize {
        self.chains.read().get(chain).map(|c| c.nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(
        &self,
        chain: &str,
    ) -> bool {
        self.len(chain) == 0
    }

    /// Snapshot of all nodes of a chain in id order.
    pub fn nodes(
        &self,
        chain: &str,
    ) -> Vec<ChainNode> {
        self.chains
            .read()
            .get(chain)
            .map(|c| c.nodes.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChainStore for MemChainStore {
    async fn append(
        &self,
        chain: &str,
        nodes: Vec<ChainNode>,
        token_key: &str,
        token: WatchToken,
    ) -> Result<()> {
        let mut chains = self.chains.write();
        let target = chains.entry(chain.to_string()).or_default();

        // validate the whole unit before touching anything
        let mut batch_cursors = HashSet::new();
        let mut floor = target.max_id;
        for node in &nodes {
            if target.cursors.contains_key(&node.cursor) || !batch_cursors.insert(&node.cursor) {
                debug!(chain, cursor = %node.cursor, "append rejected by cursor index");
                return Err(StorageError::DuplicateKey(duplicate_cursor_message(
                    chain,
                    &node.cursor,
                ))
                .into());
            }
            // ids only grow in commit order
            if node.id <= floor {
                debug!(chain, id = node.id, floor, "append rejected by id order");
                return Err(StorageError::DuplicateKey(duplicate_id_message(chain, node.id)).into());
            }
            floor = node.id;
        }

        trace!(chain, count = nodes.len(), "append chain nodes");
        target.max_id = floor;
        for node in nodes {
            target.cursors.insert(node.cursor.clone(), node.id);
            target.nodes.insert(node.id, node);
        }

        self.tokens.write().insert(token_key.to_string(), token);
        Ok(())
    }

    async fn range_after(
        &self,
        chain: &str,
        after_id: u64,
        limit: usize,
        filter: &NodeFilter,
    ) -> Result<Vec<ChainNode>> {
        let chains = self.chains.read();
        let Some(target) = chains.get(chain) else {
            return Ok(Vec::new());
        };
        Ok(target
            .nodes
            .range(after_id.saturating_add(1)..)
            .map(|(_, n)| n)
            .filter(|n| filter.matches(n))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>> {
        let chains = self.chains.read();
        Ok(chains.get(chain).and_then(|c| {
            c.nodes.values().rev().find(|n| n.cluster_time.sec >= not_before_sec).cloned()
        }))
    }

    async fn earliest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>> {
        let chains = self.chains.read();
        Ok(chains
            .get(chain)
            .and_then(|c| c.nodes.values().find(|n| n.cluster_time.sec >= not_before_sec).cloned()))
    }

    async fn find_by_cursor(
        &self,
        chain: &str,
        cursor: &str,
        not_before_sec: u32,
    ) -> Result<Option<u64>> {
        let chains = self.chains.read();
        Ok(chains.get(chain).and_then(|c| {
            let id = c.cursors.get(cursor)?;
            let node = c.nodes.get(id)?;
            (node.cluster_time.sec >= not_before_sec).then_some(*id)
        }))
    }

    async fn first_after_time(
        &self,
        chain: &str,
        after: ClusterTime,
    ) -> Result<Option<ChainNode>> {
        let chains = self.chains.read();
        Ok(chains
            .get(chain)
            .and_then(|c| c.nodes.values().find(|n| n.cluster_time > after).cloned()))
    }

    async fn tail(
        &self,
        chain: &str,
    ) -> Result<Option<ChainNode>> {
        let chains = self.chains.read();
        Ok(chains.get(chain).and_then(|c| c.nodes.values().next_back().cloned()))
    }

    async fn next_sequences(
        &self,
        sequence: &str,
        n: usize,
    ) -> Result<Vec<u64>> {
        let mut sequences = self.sequences.lock();
        let current = sequences.entry(sequence.to_string()).or_insert(0);
        let start = *current + 1;
        *current += n as u64;
        Ok((start..=*current).collect())
    }

    async fn get_token(
        &self,
        token_key: &str,
    ) -> Result<Option<WatchToken>> {
        Ok(self.tokens.read().get(token_key).cloned())
    }

    async fn find_token_by_cursor(
        &self,
        token_key: &str,
        cursor: &str,
    ) -> Result<Option<WatchToken>> {
        Ok(self
            .tokens
            .read()
            .iter()
            .find(|(key, t)| owns_token(token_key, key) && t.cursor == cursor)
            .map(|(_, t)| t.clone()))
    }

    async fn update_token_position(
        &self,
        token_key: &str,
        token: &str,
        start_at_time: ClusterTime,
    ) -> Result<()> {
        let mut tokens = self.tokens.write();
        let record = tokens.entry(token_key.to_string()).or_default();
        record.token = token.to_string();
        record.start_at_time = start_at_time;
        Ok(())
    }

    async fn purge_expired(
        &self,
        chain: &str,
        before_sec: u32,
    ) -> Result<usize> {
        let mut chains = self.chains.write();
        let Some(target) = chains.get_mut(chain) else {
            return Ok(0);
        };
        let expired: Vec<u64> = target
            .nodes
            .values()
            .filter(|n| n.cluster_time.sec < before_sec)
            .map(|n| n.id)
            .collect();
        for id in &expired {
            if let Some(node) = target.nodes.remove(id) {
                target.cursors.remove(&node.cursor);
            }
        }
        Ok(expired.len())
    }
}
