use autometrics::autometrics;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::details::DetailLoader;
use super::options::WatchEventDetail;
use super::options::WatchMode;
use super::options::WatchOptions;
use super::options::WatchResp;
use crate::is_no_event_cursor;
use crate::metrics::WATCH_REQUESTS;
use crate::utils::async_task::sleep_or_cancel;
use crate::utils::time::now_secs;
use crate::utils::time::ttl_floor;
use crate::ChainNode;
use crate::ClusterTime;
use crate::CursorType;
use crate::Key;
use crate::MixSnapshots;
use crate::NodeFilter;
use crate::ResourceConfig;
use crate::Result;
use crate::Stores;
use crate::WatchConfig;
use crate::WatchError;
use crate::API_SLO;

/// Serves chains to long-poll consumers.
///
/// Every call is one request. Cursor requests hold the caller until an event
/// matching the request is committed or the watch timeout elapses; the other
/// modes answer immediately.
#[derive(Clone)]
pub struct WatchClient {
    stores: Stores,
    resources: ResourceConfig,
    config: WatchConfig,
    details: DetailLoader,
}

impl WatchClient {
    pub fn new(
        stores: Stores,
        resources: ResourceConfig,
        config: WatchConfig,
        snapshots: MixSnapshots,
    ) -> Self {
        Self {
            details: DetailLoader::new(stores.clone(), snapshots),
            stores,
            resources,
            config,
        }
    }

    /// Key of a watchable resource.
    pub fn key(
        &self,
        resource: CursorType,
    ) -> Key {
        self.resources.key(resource)
    }

    /// Validates `opts`, dispatches on its mode and shapes the response.
    ///
    /// # Errors
    /// - [`WatchError::InvalidParam`] for malformed options
    /// - [`WatchError::ChainNodeNotExist`] when the start cursor left the chain
    /// - [`WatchError::StartFromOutOfRange`] for a start time outside retention
    /// - [`WatchError::Cancelled`] when `cancel` fires during the long poll
    #[autometrics(objective = API_SLO)]
    pub async fn watch_event(
        &self,
        opts: &WatchOptions,
        cancel: &CancellationToken,
    ) -> Result<WatchResp> {
        opts.validate()?;
        let key = self.key(opts.resource);
        let mode = opts.mode();
        WATCH_REQUESTS.with_label_values(&[opts.resource.as_str(), mode.as_str()]).inc();

        match mode {
            WatchMode::Cursor => {
                let events = self.watch_with_cursor(&key, opts, cancel).await?;
                Ok(WatchResp::shape(opts.cursor.as_deref(), opts.resource, events))
            }
            WatchMode::StartFrom => {
                let events = self.watch_with_start_from(&key, opts).await?;
                Ok(WatchResp::shape(None, opts.resource, events))
            }
            WatchMode::Now => {
                let event = self.watch_from_now(&key, opts).await?;
                Ok(WatchResp::shape(None, opts.resource, vec![event]))
            }
        }
    }

    /// Events following `opts.cursor`, long polling when none is hit yet.
    ///
    /// The no-event cursor starts from the earliest retained node, which is
    /// included when it matches.
    pub async fn watch_with_cursor(
        &self,
        key: &Key,
        opts: &WatchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<WatchEventDetail>> {
        let started = Instant::now();
        let tenant = opts.tenant_id.as_str();
        let cursor = opts.cursor.as_deref().unwrap_or_default();
        let filter = opts.node_filter();
        let chain = key.chain_name(tenant);

        let Some((start_id, mut nodes)) = self.resolve_cursor(key, tenant, cursor, &filter).await? else {
            debug!(cursor, chain = %chain, "start cursor not in chain");
            return Err(WatchError::ChainNodeNotExist(cursor.to_string()).into());
        };

        loop {
            if !nodes.is_empty() {
                return self.details_of(key, opts, nodes).await;
            }

            if !sleep_or_cancel(self.config.loop_interval(), cancel).await {
                debug!(cursor, chain = %chain, "watch cancelled by caller");
                return Err(WatchError::Cancelled.into());
            }
            trace!(chain = %chain, "nothing hit, try next round");

            if started.elapsed() > self.config.timeout() {
                let Some(tail) = self.get_latest_event(key, tenant).await? else {
                    return Ok(vec![WatchEventDetail::no_event(opts.resource)]);
                };

                // an event committed between the last round and the timeout
                // would be skipped by returning the tail, rescan once
                let nodes = self.page_after(&chain, start_id, &filter).await?;
                if !nodes.is_empty() {
                    return self.details_of(key, opts, nodes).await;
                }

                // only nodes outside the filter followed the start: resume after them
                let scanned = self
                    .stores
                    .chain
                    .range_after(&chain, start_id, 1, &NodeFilter::default())
                    .await?;
                if scanned.is_empty() {
                    return Ok(vec![WatchEventDetail::no_event(opts.resource)]);
                }
                return Ok(vec![WatchEventDetail::position(&tail.cursor, opts.resource)]);
            }

            nodes = self.page_after(&chain, start_id, &filter).await?;
        }
    }

    /// Events committed after `opts.start_from`, at most one page.
    pub async fn watch_with_start_from(
        &self,
        key: &Key,
        opts: &WatchOptions,
    ) -> Result<Vec<WatchEventDetail>> {
        let tenant = opts.tenant_id.as_str();
        let start_from = opts.start_from.unwrap_or_default();
        let diff = now_secs() - start_from;
        if diff < 0 || diff as u64 > key.ttl_secs() {
            return Err(WatchError::StartFromOutOfRange {
                start_from,
                ttl_secs: key.ttl_secs(),
            }
            .into());
        }

        let Some(tail) = self.get_latest_event(key, tenant).await? else {
            return Ok(vec![WatchEventDetail::no_event(opts.resource)]);
        };

        if tail.cluster_time.sec as i64 <= start_from {
            return Ok(vec![self.tail_event(key, opts, tail).await?]);
        }

        let chain = key.chain_name(tenant);
        let after = ClusterTime::new(start_from as u32, 0);
        let Some(first) = self.stores.chain.first_after_time(&chain, after).await? else {
            return Ok(vec![WatchEventDetail::no_event(opts.resource)]);
        };

        let filter = opts.node_filter();
        let mut nodes = self.page_after(&chain, first.id, &filter).await?;
        if filter.matches(&first) {
            nodes.insert(0, first);
        }

        if nodes.is_empty() {
            return Ok(vec![WatchEventDetail::position(&tail.cursor, opts.resource)]);
        }
        self.details_of(key, opts, nodes).await
    }

    /// The latest event if it matches `opts`, else the no-event sentinel.
    ///
    /// # Errors
    /// [`WatchError::EventDetailNotExist`] when the latest event's detail is gone.
    pub async fn watch_from_now(
        &self,
        key: &Key,
        opts: &WatchOptions,
    ) -> Result<WatchEventDetail> {
        match self.get_latest_event(key, &opts.tenant_id).await? {
            Some(tail) => self.tail_event(key, opts, tail).await,
            None => Ok(WatchEventDetail::no_event(opts.resource)),
        }
    }

    /// Newest retained node of the tenant's chain.
    #[autometrics(objective = API_SLO)]
    pub async fn get_latest_event(
        &self,
        key: &Key,
        tenant: &str,
    ) -> Result<Option<ChainNode>> {
        self.stores
            .chain
            .latest(&key.chain_name(tenant), ttl_floor(key.ttl_secs()))
            .await
    }

    /// Up to `limit` nodes following `start_cursor`.
    ///
    /// # Errors
    /// - [`WatchError::InvalidParam`] when `limit` is 0 or above the configured maximum
    /// - [`WatchError::ChainNodeNotExist`] for an unknown start cursor
    #[autometrics(objective = API_SLO)]
    pub async fn search_following_chain_nodes(
        &self,
        key: &Key,
        tenant: &str,
        start_cursor: &str,
        limit: usize,
    ) -> Result<Vec<ChainNode>> {
        if limit == 0 || limit > self.config.max_search_limit {
            return Err(WatchError::InvalidParam(format!(
                "limit {limit} must be in [1, {}]",
                self.config.max_search_limit
            ))
            .into());
        }
        let filter = NodeFilter::default();
        let chain = key.chain_name(tenant);

        let Some((start_id, mut nodes)) = self.resolve_cursor(key, tenant, start_cursor, &filter).await? else {
            return Err(WatchError::ChainNodeNotExist(start_cursor.to_string()).into());
        };
        if nodes.len() < limit {
            let after = nodes.last().map(|n| n.id).unwrap_or(start_id);
            let rest = self
                .stores
                .chain
                .range_after(&chain, after, limit - nodes.len(), &filter)
                .await?;
            nodes.extend(rest);
        }
        nodes.truncate(limit);
        Ok(nodes)
    }

    /// Cached details of `cursors` in order, `None` for evicted ones.
    #[autometrics(objective = API_SLO)]
    pub async fn search_event_details(
        &self,
        key: &Key,
        tenant: &str,
        cursors: &[String],
    ) -> Result<Vec<Option<serde_json::Value>>> {
        if cursors.is_empty() || cursors.len() > self.config.max_search_limit {
            return Err(WatchError::InvalidParam(format!(
                "cursor count {} must be in [1, {}]",
                cursors.len(),
                self.config.max_search_limit
            ))
            .into());
        }
        self.details.cached(key, tenant, cursors).await
    }

    /// Start id of a cursor scan plus the first page of matching nodes.
    ///
    /// `None` when the cursor is neither in the chain nor the last committed
    /// cursor of any flow.
    async fn resolve_cursor(
        &self,
        key: &Key,
        tenant: &str,
        cursor: &str,
        filter: &NodeFilter,
    ) -> Result<Option<(u64, Vec<ChainNode>)>> {
        let chain = key.chain_name(tenant);
        let not_before = ttl_floor(key.ttl_secs());

        if is_no_event_cursor(cursor) {
            let Some(earliest) = self.stores.chain.earliest(&chain, not_before).await? else {
                // nothing retained, continue from wherever the chain ends
                let last_id = self.stores.chain.tail(&chain).await?.map(|n| n.id).unwrap_or(0);
                return Ok(Some((last_id, Vec::new())));
            };
            let mut nodes = self.page_after(&chain, earliest.id, filter).await?;
            if filter.matches(&earliest) {
                nodes.insert(0, earliest.clone());
            }
            return Ok(Some((earliest.id, nodes)));
        }

        let id = match self.stores.chain.find_by_cursor(&chain, cursor, not_before).await? {
            Some(id) => id,
            None => match self.stores.chain.find_token_by_cursor(&key.token_key(tenant), cursor).await? {
                // the batch committing this cursor had no node of this chain
                Some(token) => token.id,
                None => return Ok(None),
            },
        };
        let nodes = self.page_after(&chain, id, filter).await?;
        Ok(Some((id, nodes)))
    }

    async fn page_after(
        &self,
        chain: &str,
        after_id: u64,
        filter: &NodeFilter,
    ) -> Result<Vec<ChainNode>> {
        self.stores
            .chain
            .range_after(chain, after_id, self.config.event_step, filter)
            .await
    }

    /// Response for the chain tail: the event with its detail when it
    /// matches, else the no-event sentinel.
    async fn tail_event(
        &self,
        key: &Key,
        opts: &WatchOptions,
        tail: ChainNode,
    ) -> Result<WatchEventDetail> {
        if !opts.node_filter().matches(&tail) {
            return Ok(WatchEventDetail::no_event(opts.resource));
        }

        let detail = self
            .details
            .load(key, &opts.tenant_id, &opts.fields, std::slice::from_ref(&tail))
            .await?
            .pop()
            .flatten();
        let Some(detail) = detail else {
            warn!(cursor = %tail.cursor, resource = %opts.resource, "latest event detail not exist");
            return Err(WatchError::EventDetailNotExist(tail.cursor).into());
        };

        let empty = detail.is_null() || detail.as_object().is_some_and(|d| d.is_empty());
        Ok(WatchEventDetail {
            cursor: tail.cursor,
            resource: opts.resource,
            event_type: Some(tail.event_type),
            detail: if empty { None } else { Some(detail) },
        })
    }

    async fn details_of(
        &self,
        key: &Key,
        opts: &WatchOptions,
        nodes: Vec<ChainNode>,
    ) -> Result<Vec<WatchEventDetail>> {
        let details = self.details.load(key, &opts.tenant_id, &opts.fields, &nodes).await?;
        let host_identity = key.resource() == CursorType::HostIdentifier;

        let mut events = Vec::with_capacity(nodes.len());
        for (node, detail) in nodes.iter().zip(details) {
            let detail = match detail {
                Some(d) => d,
                // removed hosts have no identity left to report
                None if host_identity => continue,
                None => {
                    error!(cursor = %node.cursor, oid = %node.oid, "event detail not found in cache nor documents");
                    serde_json::Value::Null
                }
            };
            events.push(WatchEventDetail {
                cursor: node.cursor.clone(),
                resource: opts.resource,
                event_type: Some(node.event_type),
                detail: Some(detail),
            });
        }

        if events.is_empty() {
            // resume after the skipped nodes next time
            if let Some(last) = nodes.last() {
                return Ok(vec![WatchEventDetail {
                    cursor: last.cursor.clone(),
                    resource: opts.resource,
                    event_type: Some(last.event_type),
                    detail: None,
                }]);
            }
        }
        Ok(events)
    }
}
