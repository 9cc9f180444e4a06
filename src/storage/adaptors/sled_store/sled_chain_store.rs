use async_trait::async_trait;
use sled::transaction::abort;
use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionError;
use sled::Batch;
use sled::Transactional;
use sled::Tree;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use super::CHAIN_TREE_PREFIX;
use super::CURSOR_TREE_PREFIX;
use super::SEQUENCE_TREE;
use super::TAIL_TREE;
use super::TOKEN_TREE;
use crate::duplicate_cursor_message;
use crate::duplicate_id_message;
use crate::owns_token;
use crate::ChainNode;
use crate::ChainStore;
use crate::ClusterTime;
use crate::Error;
use crate::NodeFilter;
use crate::Result;
use crate::StorageError;
use crate::WatchToken;

/// Chain store on sled.
///
/// Each chain owns a node tree keyed by big endian id and a cursor tree
/// acting as the unique cursor index. Appends run as one multi-tree
/// transaction over node, cursor, tail and token trees; the tail tree keeps
/// the highest id of each chain so ids only grow in commit order.
pub struct SledChainStore {
    db: sled::Db,
    tokens: Tree,
    sequences: Tree,
    tails: Tree,
}

impl std::fmt::Debug for SledChainStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledChainStore").finish()
    }
}

impl SledChainStore {
    pub fn new(db: sled::Db) -> Result<Self> {
        let tokens = db.open_tree(TOKEN_TREE)?;
        let sequences = db.open_tree(SEQUENCE_TREE)?;
        let tails = db.open_tree(TAIL_TREE)?;
        Ok(Self {
            db,
            tokens,
            sequences,
            tails,
        })
    }

    #[inline]
    fn id_to_key(id: u64) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn key_to_id(key: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| StorageError::DbError(format!("invalid id key of {} bytes", key.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn node_tree(
        &self,
        chain: &str,
    ) -> Result<Tree> {
        Ok(self.db.open_tree(format!("{CHAIN_TREE_PREFIX}{chain}"))?)
    }

    fn cursor_tree(
        &self,
        chain: &str,
    ) -> Result<Tree> {
        Ok(self.db.open_tree(format!("{CURSOR_TREE_PREFIX}{chain}"))?)
    }

    fn decode_node(bytes: &[u8]) -> Result<ChainNode> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn decode_token(bytes: &[u8]) -> Result<WatchToken> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn map_transaction_error(e: TransactionError<StorageError>) -> Error {
    match e {
        TransactionError::Abort(e) => e.into(),
        TransactionError::Storage(e) => e.into(),
    }
}

#[async_trait]
impl ChainStore for SledChainStore {
    #[instrument(skip(self, nodes, token))]
    async fn append(
        &self,
        chain: &str,
        nodes: Vec<ChainNode>,
        token_key: &str,
        token: WatchToken,
    ) -> Result<()> {
        let node_tree = self.node_tree(chain)?;
        let cursor_tree = self.cursor_tree(chain)?;

        let mut encoded = Vec::with_capacity(nodes.len());
        for node in &nodes {
            encoded.push((node.id, node.cursor.clone(), bincode::serialize(node)?));
        }
        let token_bytes = bincode::serialize(&token)?;

        // chains written before the tail tree existed start from their last node
        let stored_tail = match node_tree.last()? {
            Some((key, _)) => Self::key_to_id(&key)?,
            None => 0,
        };

        trace!(chain, count = encoded.len(), "append chain nodes");
        (&node_tree, &cursor_tree, &self.tails, &self.tokens)
            .transaction(|(n, c, tails, t)| {
                let mut floor = tails
                    .get(chain.as_bytes())?
                    .and_then(|b| <[u8; 8]>::try_from(b.as_ref()).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(stored_tail);
                for (id, cursor, bytes) in &encoded {
                    if c.get(cursor.as_bytes())?.is_some() {
                        return abort(StorageError::DuplicateKey(duplicate_cursor_message(
                            chain, cursor,
                        )));
                    }
                    if *id <= floor {
                        return abort(StorageError::DuplicateKey(duplicate_id_message(chain, *id)));
                    }
                    let key = Self::id_to_key(*id);
                    c.insert(cursor.as_bytes(), &key[..])?;
                    n.insert(&key[..], bytes.as_slice())?;
                    floor = *id;
                }
                tails.insert(chain.as_bytes(), &Self::id_to_key(floor)[..])?;
                t.insert(token_key.as_bytes(), token_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<StorageError>>(())
            })
            .map_err(|e| {
                debug!(chain, "append aborted: {:?}", e);
                map_transaction_error(e)
            })
    }

    async fn range_after(
        &self,
        chain: &str,
        after_id: u64,
        limit: usize,
        filter: &NodeFilter,
    ) -> Result<Vec<ChainNode>> {
        let tree = self.node_tree(chain)?;
        let mut nodes = Vec::new();
        for item in tree.range(Self::id_to_key(after_id.saturating_add(1))..) {
            if nodes.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let node = Self::decode_node(&value)?;
            if filter.matches(&node) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn latest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>> {
        let tree = self.node_tree(chain)?;
        for item in tree.iter().rev() {
            let (_, value) = item?;
            let node = Self::decode_node(&value)?;
            if node.cluster_time.sec >= not_before_sec {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    async fn earliest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>> {
        let tree = self.node_tree(chain)?;
        for item in tree.iter() {
            let (_, value) = item?;
            let node = Self::decode_node(&value)?;
            if node.cluster_time.sec >= not_before_sec {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    async fn find_by_cursor(
        &self,
        chain: &str,
        cursor: &str,
        not_before_sec: u32,
    ) -> Result<Option<u64>> {
        let Some(key) = self.cursor_tree(chain)?.get(cursor.as_bytes())? else {
            return Ok(None);
        };
        let Some(value) = self.node_tree(chain)?.get(&key)? else {
            return Ok(None);
        };
        let node = Self::decode_node(&value)?;
        Ok((node.cluster_time.sec >= not_before_sec).then_some(node.id))
    }

    async fn first_after_time(
        &self,
        chain: &str,
        after: ClusterTime,
    ) -> Result<Option<ChainNode>> {
        let tree = self.node_tree(chain)?;
        for item in tree.iter() {
            let (_, value) = item?;
            let node = Self::decode_node(&value)?;
            if node.cluster_time > after {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    async fn tail(
        &self,
        chain: &str,
    ) -> Result<Option<ChainNode>> {
        match self.node_tree(chain)?.last()? {
            Some((_, value)) => Ok(Some(Self::decode_node(&value)?)),
            None => Ok(None),
        }
    }

    async fn next_sequences(
        &self,
        sequence: &str,
        n: usize,
    ) -> Result<Vec<u64>> {
        let step = n as u64;
        let updated = self.sequences.update_and_fetch(sequence.as_bytes(), |old| {
            let current = old
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some((current + step).to_be_bytes().to_vec())
        })?;
        let last = match updated {
            Some(bytes) => Self::key_to_id(&bytes)?,
            None => return Err(StorageError::DbError(format!("sequence {sequence} vanished")).into()),
        };
        Ok((last + 1 - step..=last).collect())
    }

    async fn get_token(
        &self,
        token_key: &str,
    ) -> Result<Option<WatchToken>> {
        match self.tokens.get(token_key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_token(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_token_by_cursor(
        &self,
        token_key: &str,
        cursor: &str,
    ) -> Result<Option<WatchToken>> {
        for item in self.tokens.scan_prefix(token_key.as_bytes()) {
            let (key, value) = item?;
            if !owns_token(token_key, &String::from_utf8_lossy(&key)) {
                continue;
            }
            let token = Self::decode_token(&value)?;
            if token.cursor == cursor {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    async fn update_token_position(
        &self,
        token_key: &str,
        token: &str,
        start_at_time: ClusterTime,
    ) -> Result<()> {
        self.tokens
            .transaction(|t| {
                let mut record = match t.get(token_key.as_bytes())? {
                    Some(bytes) => match bincode::deserialize::<WatchToken>(&bytes) {
                        Ok(r) => r,
                        Err(e) => return abort(StorageError::BincodeError(e)),
                    },
                    None => WatchToken::default(),
                };
                record.token = token.to_string();
                record.start_at_time = start_at_time;
                let bytes = match bincode::serialize(&record) {
                    Ok(b) => b,
                    Err(e) => return abort(StorageError::BincodeError(e)),
                };
                t.insert(token_key.as_bytes(), bytes)?;
                Ok(())
            })
            .map_err(map_transaction_error)
    }

    async fn purge_expired(
        &self,
        chain: &str,
        before_sec: u32,
    ) -> Result<usize> {
        let node_tree = self.node_tree(chain)?;
        let cursor_tree = self.cursor_tree(chain)?;
        let mut nodes_batch = Batch::default();
        let mut cursor_batch = Batch::default();
        let mut purged = 0;

        for item in node_tree.iter() {
            let (key, value) = item?;
            let node = Self::decode_node(&value)?;
            if node.cluster_time.sec < before_sec {
                nodes_batch.remove(key);
                cursor_batch.remove(node.cursor.as_bytes());
                purged += 1;
            }
        }

        // cursor index first so a crash never leaves an indexed cursor without node
        cursor_tree.apply_batch(cursor_batch)?;
        node_tree.apply_batch(nodes_batch)?;
        Ok(purged)
    }
}
