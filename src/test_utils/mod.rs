//! Components shared by unit tests: node and event builders, mem store
//! bundles and the test logger.
use std::sync::Arc;

use serde_json::Value;

use crate::ArchiveDoc;
use crate::ChainNode;
use crate::ChangeDesc;
use crate::ChangeEvent;
use crate::ClusterTime;
use crate::EventType;
use crate::MemArchiveStore;
use crate::MemChainStore;
use crate::MemDetailCache;
use crate::MemDocumentStore;
use crate::OperType;
use crate::Stores;

pub const TENANT: &str = "t";

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

/// Update node of tenant [`TENANT`] with an oid derived from `id`.
pub fn node(
    id: u64,
    cursor: &str,
    sec: u32,
) -> ChainNode {
    ChainNode {
        id,
        cluster_time: ClusterTime::new(sec, 0),
        oid: format!("oid-{id}"),
        event_type: EventType::Update,
        token: format!("tok-{id}"),
        cursor: cursor.to_string(),
        instance_id: id as i64,
        sub_resource: Vec::new(),
        tenant_id: TENANT.to_string(),
    }
}

/// Raw change event of tenant [`TENANT`].
pub fn change_event(
    collection: &str,
    oid: &str,
    oper: OperType,
    sec: u32,
    nano: u32,
    document: Value,
) -> ChangeEvent {
    ChangeEvent {
        oid: oid.to_string(),
        document,
        operation_type: oper,
        collection: collection.to_string(),
        tenant_id: TENANT.to_string(),
        cluster_time: ClusterTime::new(sec, nano),
        token: format!("tok-{oid}-{sec}-{nano}"),
        change_desc: None,
    }
}

/// Update event whose description touches `fields`.
pub fn update_event(
    collection: &str,
    oid: &str,
    sec: u32,
    nano: u32,
    document: Value,
    fields: &[&str],
) -> ChangeEvent {
    let mut event = change_event(collection, oid, OperType::Update, sec, nano, document);
    let mut desc = ChangeDesc::default();
    for f in fields {
        desc.updated_fields.insert(f.to_string(), Value::Null);
    }
    event.change_desc = Some(desc);
    event
}

/// Memory backed stores of one test.
#[derive(Clone, Default)]
pub struct TestStores {
    pub chain: Arc<MemChainStore>,
    pub cache: Arc<MemDetailCache>,
    pub archive: Arc<MemArchiveStore>,
    pub docs: Arc<MemDocumentStore>,
}

impl TestStores {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestStores {
    /// Trait object handles over the same stores.
    pub fn stores(&self) -> Stores {
        Stores {
            chain: self.chain.clone(),
            cache: self.cache.clone(),
            archive: self.archive.clone(),
            docs: self.docs.clone(),
        }
    }
}

/// Archive record of tenant [`TENANT`] created at `create_time`.
pub fn archive_doc(
    coll: &str,
    oid: &str,
    detail: Value,
    create_time: i64,
) -> ArchiveDoc {
    ArchiveDoc {
        oid: oid.to_string(),
        coll: coll.to_string(),
        detail,
        tenant_id: TENANT.to_string(),
        create_time,
    }
}
