use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

/// Resource a cursor (and its chain) belongs to.
///
/// The integer codes are part of the cursor wire format and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CursorType {
    /// Unset or unrecognised type, never encodable
    Unknown,
    /// Synthetic type of the "no event" sentinel cursor
    NoEvent,
    Host,
    ModuleHostRelation,
    Biz,
    Set,
    Module,
    ObjectBase,
    Process,
    ProcessInstanceRelation,
    HostIdentifier,
    MainlineInstance,
    InstAsst,
    BizSet,
    BizSetRelation,
    Plat,
    Project,
    KubeCluster,
    KubeNode,
    KubeNamespace,
    KubeWorkload,
    KubePod,
}

impl CursorType {
    /// Every resource that owns a chain.
    pub const WATCHABLE: [CursorType; 20] = [
        CursorType::Host,
        CursorType::ModuleHostRelation,
        CursorType::Biz,
        CursorType::Set,
        CursorType::Module,
        CursorType::ObjectBase,
        CursorType::Process,
        CursorType::ProcessInstanceRelation,
        CursorType::HostIdentifier,
        CursorType::MainlineInstance,
        CursorType::InstAsst,
        CursorType::BizSet,
        CursorType::BizSetRelation,
        CursorType::Plat,
        CursorType::Project,
        CursorType::KubeCluster,
        CursorType::KubeNode,
        CursorType::KubeNamespace,
        CursorType::KubeWorkload,
        CursorType::KubePod,
    ];

    pub fn to_int(self) -> i64 {
        match self {
            CursorType::Unknown => 0,
            CursorType::NoEvent => 1,
            CursorType::Host => 2,
            CursorType::ModuleHostRelation => 3,
            CursorType::Biz => 4,
            CursorType::Set => 5,
            CursorType::Module => 6,
            CursorType::ObjectBase => 7,
            CursorType::Process => 8,
            CursorType::ProcessInstanceRelation => 9,
            CursorType::HostIdentifier => 10,
            CursorType::MainlineInstance => 11,
            CursorType::InstAsst => 12,
            CursorType::BizSet => 13,
            CursorType::BizSetRelation => 14,
            CursorType::Plat => 15,
            CursorType::Project => 16,
            CursorType::KubeCluster => 17,
            CursorType::KubeNode => 18,
            CursorType::KubeNamespace => 19,
            CursorType::KubeWorkload => 20,
            CursorType::KubePod => 21,
        }
    }

    pub fn from_int(code: i64) -> Self {
        match code {
            1 => CursorType::NoEvent,
            2 => CursorType::Host,
            3 => CursorType::ModuleHostRelation,
            4 => CursorType::Biz,
            5 => CursorType::Set,
            6 => CursorType::Module,
            7 => CursorType::ObjectBase,
            8 => CursorType::Process,
            9 => CursorType::ProcessInstanceRelation,
            10 => CursorType::HostIdentifier,
            11 => CursorType::MainlineInstance,
            12 => CursorType::InstAsst,
            13 => CursorType::BizSet,
            14 => CursorType::BizSetRelation,
            15 => CursorType::Plat,
            16 => CursorType::Project,
            17 => CursorType::KubeCluster,
            18 => CursorType::KubeNode,
            19 => CursorType::KubeNamespace,
            20 => CursorType::KubeWorkload,
            21 => CursorType::KubePod,
            _ => CursorType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CursorType::Unknown => "unknown",
            CursorType::NoEvent => "no_event",
            CursorType::Host => "host",
            CursorType::ModuleHostRelation => "host_relation",
            CursorType::Biz => "biz",
            CursorType::Set => "set",
            CursorType::Module => "module",
            CursorType::ObjectBase => "object_instance",
            CursorType::Process => "process",
            CursorType::ProcessInstanceRelation => "process_instance_relation",
            CursorType::HostIdentifier => "host_identifier",
            CursorType::MainlineInstance => "mainline_instance",
            CursorType::InstAsst => "inst_asst",
            CursorType::BizSet => "biz_set",
            CursorType::BizSetRelation => "biz_set_relation",
            CursorType::Plat => "plat",
            CursorType::Project => "project",
            CursorType::KubeCluster => "kube_cluster",
            CursorType::KubeNode => "kube_node",
            CursorType::KubeNamespace => "kube_namespace",
            CursorType::KubeWorkload => "kube_workload",
            CursorType::KubePod => "kube_pod",
        }
    }

    /// Parses the external resource name; unknown names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        Self::WATCHABLE
            .iter()
            .copied()
            .find(|t| t.as_str() == name)
            .unwrap_or(CursorType::Unknown)
    }

    /// Resources whose events are synthesised by a rearranger.
    pub fn is_mix(self) -> bool {
        matches!(self, CursorType::HostIdentifier | CursorType::BizSetRelation)
    }
}

impl fmt::Display for CursorType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation of a raw change event as reported by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
    NoOp,
    /// Any other non-empty operation string, kept verbatim
    Other(String),
}

impl OperType {
    pub fn as_str(&self) -> &str {
        match self {
            OperType::Insert => "insert",
            OperType::Update => "update",
            OperType::Replace => "replace",
            OperType::Delete => "delete",
            OperType::Drop => "drop",
            OperType::Rename => "rename",
            OperType::DropDatabase => "dropDatabase",
            OperType::Invalidate => "invalidate",
            OperType::NoOp => "no-op",
            OperType::Other(s) => s.as_str(),
        }
    }

    /// Operations that carry a data change.
    pub fn is_data_change(&self) -> bool {
        matches!(
            self,
            OperType::Insert | OperType::Update | OperType::Replace | OperType::Delete
        )
    }
}

impl From<&str> for OperType {
    fn from(s: &str) -> Self {
        match s {
            "insert" => OperType::Insert,
            "update" => OperType::Update,
            "replace" => OperType::Replace,
            "delete" => OperType::Delete,
            "drop" => OperType::Drop,
            "rename" => OperType::Rename,
            "dropDatabase" => OperType::DropDatabase,
            "invalidate" => OperType::Invalidate,
            "no-op" => OperType::NoOp,
            other => OperType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OperType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source cluster time: seconds plus an ordinal within the second.
///
/// Only advisory for ordering; chain node ids are the total order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterTime {
    pub sec: u32,
    pub nano: u32,
}

impl ClusterTime {
    pub fn new(
        sec: u32,
        nano: u32,
    ) -> Self {
        Self { sec, nano }
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since_epoch.as_secs() as u32,
            nano: since_epoch.subsec_nanos(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nano == 0
    }
}
