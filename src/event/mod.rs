//! Raw change events, event details and resource naming.

pub mod doc;
mod key;
pub use key::*;


use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::ClusterTime;
use crate::OperType;

/// Fields touched by an update, as reported by the change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeDesc {
    pub updated_fields: Map<String, Value>,
    pub removed_fields: Vec<String>,
}

impl ChangeDesc {
    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }

    /// Whether `field` was updated or removed.
    pub fn touches(
        &self,
        field: &str,
    ) -> bool {
        self.updated_fields.contains_key(field) || self.removed_fields.iter().any(|f| f == field)
    }
}

/// One raw event yielded by the source change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Origin document id
    pub oid: String,
    /// Full document after the change; `Null` for deletes
    pub document: Value,
    pub operation_type: OperType,
    /// Source collection
    pub collection: String,
    pub tenant_id: String,
    pub cluster_time: ClusterTime,
    /// Native resume token of the change feed
    pub token: String,
    pub change_desc: Option<ChangeDesc>,
}

impl ChangeEvent {
    /// Identity of the raw event inside one feed, used in logs.
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.oid, self.cluster_time.sec, self.cluster_time.nano
        )
    }

    pub fn is_delete(&self) -> bool {
        self.operation_type == OperType::Delete
    }

    /// Update description is absent or empty, meaning every field may have changed.
    pub fn change_desc_is_empty(&self) -> bool {
        self.change_desc.as_ref().map(ChangeDesc::is_empty).unwrap_or(true)
    }
}

/// Event type visible to watch consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }

    /// Maps a data changing operation; other operations have no event type.
    pub fn from_oper(oper: &OperType) -> Option<Self> {
        match oper {
            OperType::Insert => Some(EventType::Create),
            OperType::Update | OperType::Replace => Some(EventType::Update),
            OperType::Delete => Some(EventType::Delete),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "create" => Some(EventType::Create),
            "update" => Some(EventType::Update),
            "delete" => Some(EventType::Delete),
            _ => None,
        }
    }
}

/// Payload stored in the detail cache for one chain node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    pub detail: Value,
    #[serde(default)]
    pub update_fields: Map<String, Value>,
    #[serde(default)]
    pub deleted_fields: Vec<String>,
}

impl EventDetail {
    pub fn from_event(
        event: &ChangeEvent,
        document: Value,
    ) -> Self {
        let (update_fields, deleted_fields) = match &event.change_desc {
            Some(desc) => (desc.updated_fields.clone(), desc.removed_fields.clone()),
            None => (Map::new(), Vec::new()),
        };
        Self {
            detail: document,
            update_fields,
            deleted_fields,
        }
    }
}
