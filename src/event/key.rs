use std::time::Duration;

use crate::CursorType;

// Source collections
pub const HOST_BASE: &str = "cc_HostBase";
pub const MODULE_HOST_CONFIG: &str = "cc_ModuleHostConfig";
pub const BIZ: &str = "cc_ApplicationBase";
pub const SET: &str = "cc_SetBase";
pub const MODULE: &str = "cc_ModuleBase";
pub const OBJECT_BASE: &str = "cc_ObjectBase";
pub const PROCESS: &str = "cc_Process";
pub const PROCESS_INSTANCE_RELATION: &str = "cc_ProcessInstanceRelation";
pub const INST_ASST: &str = "cc_InstAsst";
pub const BIZ_SET: &str = "cc_BizSetBase";
pub const PLAT: &str = "cc_PlatBase";
pub const PROJECT: &str = "cc_Project";
pub const KUBE_CLUSTER: &str = "cc_KubeCluster";
pub const KUBE_NODE: &str = "cc_KubeNode";
pub const KUBE_NAMESPACE: &str = "cc_KubeNamespace";
pub const KUBE_DEPLOYMENT: &str = "cc_KubeDeployment";
pub const KUBE_STATEFUL_SET: &str = "cc_KubeStatefulSet";
pub const KUBE_DAEMON_SET: &str = "cc_KubeDaemonSet";
pub const KUBE_JOB: &str = "cc_KubeJob";
pub const KUBE_CRON_JOB: &str = "cc_KubeCronJob";
pub const KUBE_POD: &str = "cc_KubePod";
pub const KUBE_CONTAINER: &str = "cc_KubeContainer";
pub const OBJ_ATTRIBUTE: &str = "cc_ObjAttDes";
pub const DEL_ARCHIVE: &str = "cc_DelArchive";

/// Workload collections paired with the sub resource they publish as.
pub const KUBE_WORKLOADS: [(&str, &str); 5] = [
    (KUBE_DEPLOYMENT, "deployment"),
    (KUBE_STATEFUL_SET, "statefulSet"),
    (KUBE_DAEMON_SET, "daemonSet"),
    (KUBE_JOB, "job"),
    (KUBE_CRON_JOB, "cronJob"),
];

/// Sub resource of a workload collection, if it is one.
pub fn kube_workload_kind(collection: &str) -> Option<&'static str> {
    KUBE_WORKLOADS
        .iter()
        .find(|(coll, _)| *coll == collection)
        .map(|(_, kind)| *kind)
}

/// Naming and retention of one resource's chain, detail cache and tokens.
///
/// Every name is tenant qualified so tenants never share a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    resource: CursorType,
    collections: Vec<String>,
    ttl_secs: u64,
}

impl Key {
    pub fn new(
        resource: CursorType,
        ttl_secs: u64,
    ) -> Self {
        Self {
            resource,
            collections: source_collections(resource),
            ttl_secs,
        }
    }

    pub fn resource(&self) -> CursorType {
        self.resource
    }

    /// Physical collections whose change feed is ingested into this chain.
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn chain_name(
        &self,
        tenant: &str,
    ) -> String {
        format!("{tenant}:{}:chain", self.resource)
    }

    /// Counter feeding chain node ids, shared by all writers of the chain.
    pub fn sequence_name(
        &self,
        tenant: &str,
    ) -> String {
        format!("{tenant}:{}:sequence", self.resource)
    }

    pub fn detail_key(
        &self,
        tenant: &str,
        cursor: &str,
    ) -> String {
        format!("event_chain:{tenant}:{}:detail:{cursor}", self.resource)
    }

    pub fn token_key(
        &self,
        tenant: &str,
    ) -> String {
        format!("{tenant}:{}", self.resource)
    }

    /// Token of one source collection feeding a mix resource.
    pub fn mix_token_key(
        &self,
        tenant: &str,
        source_collection: &str,
    ) -> String {
        format!("{tenant}:{}:{source_collection}", self.resource)
    }

    /// Lock serialising id assignment between the sub flows of a mix resource.
    pub fn lock_key(
        &self,
        tenant: &str,
    ) -> String {
        format!("event_chain:{tenant}:{}:lock", self.resource)
    }
}

fn source_collections(resource: CursorType) -> Vec<String> {
    let colls: Vec<&str> = match resource {
        CursorType::Host => vec![HOST_BASE],
        CursorType::ModuleHostRelation => vec![MODULE_HOST_CONFIG],
        CursorType::Biz => vec![BIZ],
        CursorType::Set => vec![SET],
        CursorType::Module => vec![MODULE],
        CursorType::ObjectBase | CursorType::MainlineInstance => vec![OBJECT_BASE],
        CursorType::Process => vec![PROCESS],
        CursorType::ProcessInstanceRelation => vec![PROCESS_INSTANCE_RELATION],
        CursorType::HostIdentifier => vec![HOST_BASE, MODULE_HOST_CONFIG, PROCESS],
        CursorType::InstAsst => vec![INST_ASST],
        CursorType::BizSet => vec![BIZ_SET],
        CursorType::BizSetRelation => vec![BIZ_SET, BIZ],
        CursorType::Plat => vec![PLAT],
        CursorType::Project => vec![PROJECT],
        CursorType::KubeCluster => vec![KUBE_CLUSTER],
        CursorType::KubeNode => vec![KUBE_NODE],
        CursorType::KubeNamespace => vec![KUBE_NAMESPACE],
        CursorType::KubeWorkload => KUBE_WORKLOADS.iter().map(|(c, _)| *c).collect(),
        CursorType::KubePod => vec![KUBE_POD],
        CursorType::NoEvent | CursorType::Unknown => vec![],
    };
    colls.into_iter().map(str::to_string).collect()
}
