//! Mix events: chains derived from several source collections.
//!
//! A [`MixEventFlow`] runs per source collection of a mix resource. Its raw
//! events are first rearranged into the derived resource's events by a
//! [`Rearranger`], then committed to the shared chain. Sub flows of one mix
//! resource race for the same id sequence, so id assignment and commit are
//! serialised by a [`SequenceLock`].

mod biz_set_relation;
mod host_identity;
mod scope;
mod snapshot;

pub use biz_set_relation::*;
pub use host_identity::*;
pub use scope::*;
pub use snapshot::*;

#[cfg(test)]
mod mix_flow_test;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::metrics::alarm;
use crate::metrics::CURSOR_CONFLICTS;
use crate::metrics::EVENTS_DROPPED;
use crate::metrics::STORE_ERRORS;
use crate::BatchHandler;
use crate::ChainCommitter;
use crate::ChainNode;
use crate::ChangeEvent;
use crate::CommitOutcome;
use crate::Cursor;
use crate::CursorType;
use crate::EventDetail;
use crate::EventType;
use crate::Key;
use crate::LockConfig;
use crate::LoopWatchOptions;
use crate::OperType;
use crate::PolicyRegistry;
use crate::ResourcePolicy;
use crate::Result;
use crate::SequenceLock;
use crate::Stores;
use crate::TokenHandler;
use crate::WatchToken;
use crate::BIZ;
use crate::BIZ_SET;
use crate::HOST_BASE;
use crate::MODULE_HOST_CONFIG;
use crate::PROCESS;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Rearranger: Send + Sync + 'static {
    /// Converts raw source events into events of the mix resource.
    ///
    /// An error asks for the whole batch to be retried.
    async fn rearrange(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>>;

    /// Detail stored with the node of a rearranged event. `None` leaves the
    /// detail to be built when it is read.
    async fn detail(
        &self,
        _event: &ChangeEvent,
        _rid: &str,
    ) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Cursor type of a mix event, decided by the collection it was read from.
pub fn source_cursor_type(collection: &str) -> CursorType {
    match collection {
        HOST_BASE => CursorType::Host,
        MODULE_HOST_CONFIG => CursorType::ModuleHostRelation,
        PROCESS => CursorType::Process,
        BIZ_SET => CursorType::BizSet,
        BIZ => CursorType::Biz,
        _ => CursorType::Unknown,
    }
}

pub struct MixEventFlow<R> {
    key: Key,
    tenant: String,
    source: String,
    stores: Stores,
    rearranger: R,
    policy: Arc<dyn ResourcePolicy>,
    lock: SequenceLock,
    token: TokenHandler,
    committer: ChainCommitter,
}

impl<R: Rearranger> MixEventFlow<R> {
    pub fn new(
        key: Key,
        tenant: &str,
        source: &str,
        stores: Stores,
        policies: &PolicyRegistry,
        lock_config: &LockConfig,
        rearranger: R,
    ) -> Self {
        let resource = key.resource();
        let chain = key.chain_name(tenant);
        let token_key = key.mix_token_key(tenant, source);

        let (ttl, retry_interval) = lock_config.timing(resource == CursorType::HostIdentifier);
        let lock = SequenceLock::new(key.lock_key(tenant), ttl, retry_interval, stores.cache.clone());
        let token =
            TokenHandler::new(resource, token_key.clone(), chain.clone(), stores.chain.clone()).for_mix_source();
        let committer = ChainCommitter::new(
            resource,
            chain,
            key.sequence_name(tenant),
            token_key,
            stores.chain.clone(),
        );

        Self {
            policy: policies.get(resource),
            key,
            tenant: tenant.to_string(),
            source: source.to_string(),
            stores,
            rearranger,
            lock,
            token,
            committer,
        }
    }

    pub fn token_handler(&self) -> TokenHandler {
        self.token.clone()
    }

    /// Loop options watching this flow's source collection only.
    pub fn watch_options(
        &self,
        batch_size: usize,
    ) -> LoopWatchOptions {
        LoopWatchOptions {
            name: format!("{}:{}:{}", self.tenant, self.key.resource(), self.source),
            resource: self.key.resource(),
            collections: vec![self.source.clone()],
            tenant_id: Some(self.tenant.clone()),
            batch_size,
        }
    }

    pub async fn do_batch(
        &self,
        events: Vec<ChangeEvent>,
    ) -> bool {
        let Some(last) = events.last() else {
            return false;
        };
        let rid = events[0].id();
        let resource = self.key.resource().as_str();
        let last_token = WatchToken {
            token: last.token.clone(),
            start_at_time: last.cluster_time,
            ..Default::default()
        };

        let rearranged = match self.rearranger.rearrange(events.clone(), &rid).await {
            Ok(r) => r,
            Err(e) => {
                error!(rid, source = %self.source, "rearrange {} events failed, retry: {:?}", resource, e);
                return true;
            }
        };

        let guard = match self.lock.acquire(&rid).await {
            Ok(g) => g,
            Err(e) => {
                error!(rid, key = %self.lock.key(), "get {} lock failed: {:?}", resource, e);
                return true;
            }
        };
        let retry = self.handle_events(rearranged, last_token, &rid).await;
        self.lock.release(guard, &rid).await;
        retry
    }

    async fn handle_events(
        &self,
        events: Vec<ChangeEvent>,
        last_token: WatchToken,
        rid: &str,
    ) -> bool {
        let resource = self.key.resource().as_str();

        let ids = if events.is_empty() {
            Vec::new()
        } else {
            match self
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
            }
        };

        let mut nodes = Vec::with_capacity(events.len());
        let mut details = Vec::new();
        let mut cursors = HashSet::new();
        for (event, id) in events.iter().zip(ids) {
            let node = match self.parse(event, id) {
                Ok(Some(n)) => n,
                Ok(None) => continue,
                Err(e) => {
                    error!(rid, event = %event.id(), "mint {} cursor failed, skip the batch: {:?}", resource, e);
                    alarm(resource, "hit_invalid_cursor");
                    return false;
                }
            };

            // concurrent writes of one host produce identical cursors, one is enough
            if !cursors.insert(node.cursor.clone()) {
                debug!(rid, cursor = %node.cursor, "repeated mix cursor in batch, skip");
                CURSOR_CONFLICTS.with_label_values(&[resource, "batch"]).inc();
                continue;
            }

            match self.rearranger.detail(event, rid).await {
                Ok(Some(detail)) => {
                    let stored = EventDetail::from_event(event, detail);
                    match serde_json::to_string(&stored) {
                        Ok(s) => details.push((self.key.detail_key(&self.tenant, &node.cursor), s)),
                        Err(e) => warn!(rid, cursor = %node.cursor, "encode event detail failed: {:?}", e),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(rid, event = %event.id(), "build {} event detail failed: {:?}", resource, e);
                    return true;
                }
            }

            nodes.push(node);
        }

        if nodes.is_empty() {
            info!(rid, source = %self.source, "no valid {} event in batch, only advance the token", resource);
            if let Err(e) = self
                .token
                .set_last_token_data(&last_token.token, last_token.start_at_time)
                .await
            {
                error!(rid, "set last token data failed: {:?}", e);
                STORE_ERRORS.with_label_values(&[resource, "chain"]).inc();
            }
            return false;
        }

        if !details.is_empty() {
            if let Err(e) = self.stores.cache.set_many(details, self.key.ttl()).await {
                error!(rid, "insert {} event details failed: {:?}", resource, e);
                STORE_ERRORS.with_label_values(&[resource, "cache"]).inc();
                return true;
            }
        }

        match self.committer.insert(nodes, last_token.clone(), rid).await {
            CommitOutcome::Committed(nodes) => {
                info!(
                    rid,
                    chain = %self.committer.chain(),
                    source = %self.source,
                    count = nodes.len(),
                    "insert mix events success"
                );
                false
            }
            CommitOutcome::GaveUp => {
                if let Err(e) = self
                    .token
                    .set_last_token_data(&last_token.token, last_token.start_at_time)
                    .await
                {
                    warn!(rid, "set last token data after conflict failed: {:?}", e);
                }
                false
            }
            CommitOutcome::Retry => true,
        }
    }

    /// Chain node of one rearranged event; `None` drops it.
    fn parse(
        &self,
        event: &ChangeEvent,
        id: u64,
    ) -> Result<Option<ChainNode>> {
        let resource = self.key.resource().as_str();
        if !matches!(
            event.operation_type,
            OperType::Insert | OperType::Update | OperType::Replace | OperType::Delete
        ) {
            EVENTS_DROPPED.with_label_values(&[resource, "unsupported_operation"]).inc();
            return Ok(None);
        }

        let cursor_type = source_cursor_type(&event.collection);
        if cursor_type == CursorType::Unknown {
            warn!(collection = %event.collection, "mix event from an unknown collection");
            EVENTS_DROPPED.with_label_values(&[resource, "unknown_collection"]).inc();
            return Ok(None);
        }

        let instance_id = self.policy.instance_id(&event.document);
        if instance_id <= 0 {
            warn!(event = %event.id(), "mix event without instance id, skip");
            EVENTS_DROPPED.with_label_values(&[resource, "invalid_instance_id"]).inc();
            return Ok(None);
        }

        let cursor = Cursor::for_event(
            cursor_type,
            event.cluster_time,
            &event.oid,
            event.operation_type.clone(),
            0,
        )
        .encode()?;

        Ok(Some(ChainNode {
            id,
            cluster_time: event.cluster_time,
            oid: event.oid.clone(),
            event_type: EventType::Update,
            token: event.token.clone(),
            cursor,
            instance_id,
            sub_resource: Vec::new(),
            tenant_id: self.tenant.clone(),
        }))
    }
}

#[async_trait]
impl<R: Rearranger> BatchHandler for MixEventFlow<R> {
    async fn do_batch(
        &self,
        events: Vec<ChangeEvent>,
    ) -> bool {
        MixEventFlow::do_batch(self, events).await
    }
}
