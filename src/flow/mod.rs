//! Ingestion flow: raw change events in, chain nodes and details out.
//!
//! One [`Flow`] runs per `(resource, tenant)`. A batch is parsed into chain
//! nodes, deduplicated by cursor, its details are written to the cache and
//! finally the nodes and the watch token are committed in one atomic unit.
//! Details go first so a reader never sees a node without its detail.

mod archive_cleaner;
mod commit;
mod cursor_queue;
mod lock;
mod parser;

pub use archive_cleaner::*;
pub use commit::*;
pub use cursor_queue::*;
pub use lock::*;
pub use parser::*;

#[cfg(test)]
mod archive_cleaner_test;
#[cfg(test)]
mod parser_test;

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::metrics::CURSOR_CONFLICTS;
use crate::metrics::EVENTS_DROPPED;
use crate::metrics::STORE_ERRORS;
use crate::BatchHandler;
use crate::ChangeEvent;
use crate::FlowConfig;
use crate::Key;
use crate::LoopWatchOptions;
use crate::PolicyRegistry;
use crate::Stores;
use crate::TokenHandler;
use crate::WatchToken;

pub struct Flow {
    key: Key,
    tenant: String,
    stores: Stores,
    parser: EventParser,
    token: TokenHandler,
    committer: ChainCommitter,
    queue: CursorQueue,
}

impl Flow {
    pub fn new(
        key: Key,
        tenant: &str,
        stores: Stores,
        policies: &PolicyRegistry,
        config: &FlowConfig,
    ) -> Self {
        let resource = key.resource();
        let chain = key.chain_name(tenant);
        let token_key = key.token_key(tenant);

        let parser = EventParser::new(
            resource,
            policies.get(resource),
            stores.docs.clone(),
            stores.archive.clone(),
        );
        let token = TokenHandler::new(resource, token_key.clone(), chain.clone(), stores.chain.clone());
        let committer = ChainCommitter::new(
            resource,
            chain,
            key.sequence_name(tenant),
            token_key,
            stores.chain.clone(),
        );

        Self {
            key,
            tenant: tenant.to_string(),
            stores,
            parser,
            token,
            committer,
            queue: CursorQueue::new(config.cursor_queue_size),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn token_handler(&self) -> TokenHandler {
        self.token.clone()
    }

    /// Loop options watching every source collection of this flow's tenant.
    pub fn watch_options(
        &self,
        batch_size: usize,
    ) -> LoopWatchOptions {
        LoopWatchOptions {
            name: format!("{}:{}", self.tenant, self.key.resource()),
            resource: self.key.resource(),
            collections: self.key.collections().to_vec(),
            tenant_id: Some(self.tenant.clone()),
            batch_size,
        }
    }

    /// Handles one batch; returns whether it must be retried from the last
    /// committed token.
    pub async fn do_batch(
        &self,
        events: Vec<ChangeEvent>,
    ) -> bool {
        let Some(last) = events.last() else {
            return false;
        };
        let rid = events[0].id();
        let resource = self.key.resource().as_str();

        let deleted = match delete_details(self.stores.archive.as_ref(), &events).await {
            Ok(d) => d,
            Err(e) => {
                error!(rid, "get delete event details from archive failed: {:?}", e);
                STORE_ERRORS.with_label_values(&[resource, "archive"]).inc();
                return true;
            }
        };

        let ids = match self
            .stores
            .chain
            .next_sequences(self.committer.sequence(), events.len())
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(rid, "get {} event ids failed: {:?}", resource, e);
                STORE_ERRORS.with_label_values(&[resource, "chain"]).inc();
                return true;
            }
        };

        let mut parsed = Vec::with_capacity(events.len());
        let mut batch_cursors = HashSet::new();
        let mut hit_conflict = false;
        for (event, id) in events.iter().zip(ids) {
            let p = match self.parser.parse(event, &deleted, id, &rid).await {
                ParseOutcome::Parsed(p) => p,
                ParseOutcome::Dropped(reason) => {
                    debug!(rid, oid = %event.oid, reason, "event dropped");
                    continue;
                }
                ParseOutcome::Abort { retry } => return retry,
            };

            // committed by an earlier batch of this process
            if self.queue.contains(&p.node.cursor) {
                warn!(rid, cursor = %p.node.cursor, "cursor already committed, skip the event");
                CURSOR_CONFLICTS.with_label_values(&[resource, "queue"]).inc();
                EVENTS_DROPPED.with_label_values(&[resource, "committed_cursor"]).inc();
                continue;
            }
            if !batch_cursors.insert(p.node.cursor.clone()) {
                hit_conflict = true;
                CURSOR_CONFLICTS.with_label_values(&[resource, "batch"]).inc();
            }
            parsed.push(p);
        }

        if parsed.is_empty() {
            info!(rid, count = events.len(), "no valid event in batch, only advance the token");
            if let Err(e) = self.token.set_last_token_data(&last.token, last.cluster_time).await {
                error!(rid, "set last token data failed: {:?}", e);
                STORE_ERRORS.with_label_values(&[resource, "chain"]).inc();
                return true;
            }
            return false;
        }

        // later details of a repeated cursor overwrite earlier ones, matching
        // the node kept by rearrange_events
        let details: Vec<(String, String)> = parsed
            .iter()
            .map(|p| (self.key.detail_key(&self.tenant, &p.node.cursor), p.detail.clone()))
            .collect();
        if let Err(e) = self.stores.cache.set_many(details, self.key.ttl()).await {
            error!(rid, "insert {} event details failed: {:?}", resource, e);
            STORE_ERRORS.with_label_values(&[resource, "cache"]).inc();
            return true;
        }

        let mut nodes: Vec<_> = parsed.into_iter().map(|p| p.node).collect();
        if hit_conflict {
            nodes = rearrange_events(nodes);
        }

        let token = WatchToken {
            token: last.token.clone(),
            start_at_time: last.cluster_time,
            ..Default::default()
        };
        match self.committer.insert(nodes, token, &rid).await {
            CommitOutcome::Committed(nodes) => {
                self.queue.push_all(nodes.iter().map(|n| n.cursor.as_str()));
                info!(rid, chain = %self.committer.chain(), count = nodes.len(), "insert events success");
                false
            }
            CommitOutcome::GaveUp => {
                // the conflicting node is already in the chain
                if let Err(e) = self.token.set_last_token_data(&last.token, last.cluster_time).await {
                    warn!(rid, "set last token data after conflict failed: {:?}", e);
                }
                false
            }
            CommitOutcome::Retry => true,
        }
    }
}

#[async_trait]
impl BatchHandler for Flow {
    async fn do_batch(
        &self,
        events: Vec<ChangeEvent>,
    ) -> bool {
        Flow::do_batch(self, events).await
    }
}
