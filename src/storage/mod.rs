//! Storage seams of the event chain.
//!
//! - [`ChainStore`]: ordered chain nodes, watch tokens and id sequences of the
//!   primary store. A unique cursor index is the only concurrency control for
//!   node writes; nodes and token are written in one atomic unit.
//! - [`DetailCache`]: TTL keyed fast cache holding event details and locks.
//! - [`ArchiveStore`]: pre-deletion snapshots of deleted documents.
//! - [`DocumentStore`]: read access to live source documents, used to rebuild
//!   evicted details and to derive mix events.
mod adaptors;
mod reaper;
pub use adaptors::*;
pub use reaper::*;


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::ClusterTime;
use crate::EventType;
use crate::Result;

/// Index name carried by duplicate cursor errors.
pub const CURSOR_INDEX: &str = "index_cursor";
/// Index name carried by duplicate id errors.
pub const ID_INDEX: &str = "index_id";

/// One entry of a resource's ordered event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    /// Strictly increasing in commit order, never reused
    pub id: u64,
    pub cluster_time: ClusterTime,
    pub oid: String,
    pub event_type: EventType,
    /// Resume token of the raw event this node was built from
    pub token: String,
    /// Unique within the chain
    pub cursor: String,
    /// 0 when the resource has no numeric instance id
    pub instance_id: i64,
    pub sub_resource: Vec<String>,
    pub tenant_id: String,
}

/// Persisted ingestion position of one flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchToken {
    pub token: String,
    pub start_at_time: ClusterTime,
    /// Id and cursor of the last committed node
    pub id: u64,
    pub cursor: String,
}

/// Node selection of watch scans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFilter {
    /// Empty means every event type
    pub event_types: Vec<EventType>,
    pub sub_resource: Option<String>,
}

impl NodeFilter {
    pub fn matches(
        &self,
        node: &ChainNode,
    ) -> bool {
        let type_hit = self.event_types.is_empty() || self.event_types.contains(&node.event_type);
        let sub_hit = match &self.sub_resource {
            Some(sub) if !sub.is_empty() => node.sub_resource.iter().any(|s| s == sub),
            _ => true,
        };
        type_hit && sub_hit
    }
}

/// Pre-deletion snapshot of a deleted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDoc {
    pub oid: String,
    /// Collection the document was deleted from
    pub coll: String,
    pub detail: Value,
    pub tenant_id: String,
    /// Archive time (unit: seconds)
    pub create_time: i64,
}

/// Handles to every store a flow or watch client talks to.
#[derive(Clone)]
pub struct Stores {
    pub chain: Arc<dyn ChainStore>,
    pub cache: Arc<dyn DetailCache>,
    pub archive: Arc<dyn ArchiveStore>,
    pub docs: Arc<dyn DocumentStore>,
}

/// Duplicate cursor message in the shape the flow parses.
pub fn duplicate_cursor_message(
    chain: &str,
    cursor: &str,
) -> String {
    format!("collection: {chain} index: {CURSOR_INDEX} dup key: {{ cursor: \"{cursor}\" }}")
}

/// Whether the token record stored under `record_key` belongs to the flow
/// keyed `token_key`, either directly or as a mix source sub key.
pub fn owns_token(
    token_key: &str,
    record_key: &str,
) -> bool {
    match record_key.strip_prefix(token_key) {
        Some(rest) => rest.is_empty() || rest.starts_with(':'),
        None => false,
    }
}

/// Duplicate id message; also raised for ids not above the chain tail.
pub fn duplicate_id_message(
    chain: &str,
    id: u64,
) -> String {
    format!("collection: {chain} index: {ID_INDEX} dup key: {{ id: {id} }}")
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainStore: Send + Sync + 'static {
    /// Inserts `nodes` and replaces the token record in one atomic unit.
    ///
    /// Any node whose cursor already exists, or whose id is not above the
    /// highest id the chain ever held, aborts the whole unit with
    /// `StorageError::DuplicateKey`.
    async fn append(
        &self,
        chain: &str,
        nodes: Vec<ChainNode>,
        token_key: &str,
        token: WatchToken,
    ) -> Result<()>;

    /// Nodes with `id > after_id`, ascending, at most `limit`.
    async fn range_after(
        &self,
        chain: &str,
        after_id: u64,
        limit: usize,
        filter: &NodeFilter,
    ) -> Result<Vec<ChainNode>>;

    /// Newest node whose cluster time is not before `not_before_sec`.
    async fn latest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>>;

    /// Oldest node whose cluster time is not before `not_before_sec`.
    async fn earliest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>>;

    async fn find_by_cursor(
        &self,
        chain: &str,
        cursor: &str,
        not_before_sec: u32,
    ) -> Result<Option<u64>>;

    /// Lowest id node with cluster time strictly after `after`.
    async fn first_after_time(
        &self,
        chain: &str,
        after: ClusterTime,
    ) -> Result<Option<ChainNode>>;

    /// Newest node regardless of expiry.
    async fn tail(
        &self,
        chain: &str,
    ) -> Result<Option<ChainNode>>;

    /// `n` contiguous ids from the named counter.
    async fn next_sequences(
        &self,
        sequence: &str,
        n: usize,
    ) -> Result<Vec<u64>>;

    async fn get_token(
        &self,
        token_key: &str,
    ) -> Result<Option<WatchToken>>;

    /// Token record of `token_key`, or of one of its source collection keys,
    /// whose last committed cursor is `cursor`. Lets a consumer holding the
    /// cursor of an all-dropped tail batch keep its position.
    async fn find_token_by_cursor(
        &self,
        token_key: &str,
        cursor: &str,
    ) -> Result<Option<WatchToken>>;

    /// Updates resume token and start time only, keeping id and cursor.
    async fn update_token_position(
        &self,
        token_key: &str,
        token: &str,
        start_at_time: ClusterTime,
    ) -> Result<()>;

    /// Deletes nodes older than `before_sec`; returns how many were removed.
    async fn purge_expired(
        &self,
        chain: &str,
        before_sec: u32,
    ) -> Result<usize>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DetailCache: Send + Sync + 'static {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<String>>;

    /// Values in the order of `keys`, `None` for misses.
    async fn mget(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<String>>>;

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<()>;

    /// Pipelined write of many entries sharing one ttl.
    async fn set_many(
        &self,
        entries: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()>;

    /// Sets only if absent; returns whether the value was written.
    async fn set_nx(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool>;

    async fn del(
        &self,
        key: &str,
    ) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArchiveStore: Send + Sync + 'static {
    async fn insert(
        &self,
        doc: ArchiveDoc,
    ) -> Result<()>;

    /// Archived documents of `coll` with one of the given oids.
    async fn find_by_oids(
        &self,
        tenant: &str,
        coll: &str,
        oids: &[String],
    ) -> Result<Vec<ArchiveDoc>>;

    /// Archived documents of `coll` whose `detail.<field>` is one of `values`
    /// and that were archived at or after `created_after`.
    async fn find_by_detail_field(
        &self,
        tenant: &str,
        coll: &str,
        field: &str,
        values: &[i64],
        created_after: i64,
    ) -> Result<Vec<ArchiveDoc>>;

    /// Removes up to `limit` documents archived before `before`.
    async fn delete_before(
        &self,
        before: i64,
        limit: usize,
    ) -> Result<usize>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Live documents by origin id, as `(oid, document)` pairs.
    async fn find_by_oids(
        &self,
        tenant: &str,
        coll: &str,
        oids: &[String],
    ) -> Result<Vec<(String, Value)>>;

    /// Documents whose integer `field` is one of `values`.
    async fn find_by_field_in(
        &self,
        tenant: &str,
        coll: &str,
        field: &str,
        values: &[i64],
    ) -> Result<Vec<Value>>;

    /// Documents whose `field` equals `value`.
    async fn find_by_field_eq(
        &self,
        tenant: &str,
        coll: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>>;

    /// Page of documents sorted by integer `sort_field`, strictly after `after`.
    async fn find_page(
        &self,
        tenant: &str,
        coll: &str,
        sort_field: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Value>>;
}
