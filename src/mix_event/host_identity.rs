use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Rearranger;
use crate::event::doc;
use crate::ArchiveStore;
use crate::ChangeEvent;
use crate::DocumentStore;
use crate::Result;
use crate::HOST_BASE;
use crate::MODULE_HOST_CONFIG;
use crate::PROCESS;
use crate::PROCESS_INSTANCE_RELATION;

pub const HOST_ID_FIELD: &str = "bk_host_id";
pub const PROCESS_ID_FIELD: &str = "bk_process_id";

/// Host fields that make up a host's identity.
pub const CARED_HOST_FIELDS: [&str; 5] = [
    "bk_host_innerip",
    "bk_os_type",
    "bk_cloud_id",
    HOST_ID_FIELD,
    "bk_supplier_account",
];

const PROCESS_IDENTITY_FIELDS: [&str; 7] = [
    PROCESS_ID_FIELD,
    "bk_process_name",
    "bk_func_id",
    "bind_ip",
    "port",
    "protocol",
    "bk_start_param_regex",
];

/// Relation archives older than the batch by more than this are not trusted.
const ARCHIVE_LOOKBACK_SECS: i64 = 60;

/// Turns host, host relation and process events into "host identity changed"
/// events, one per affected host, each carrying `{"bk_host_id": N}`.
pub struct HostIdentityRearranger {
    docs: Arc<dyn DocumentStore>,
    archive: Arc<dyn ArchiveStore>,
}

#[async_trait]
impl Rearranger for HostIdentityRearranger {
    async fn rearrange(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>> {
        let Some(first) = events.first() else {
            return Ok(events);
        };

        match first.collection.as_str() {
            HOST_BASE => Ok(rearrange_host_events(events, rid)),
            MODULE_HOST_CONFIG => self.rearrange_relation_events(events, rid).await,
            PROCESS => self.rearrange_process_events(events, rid).await,
            other => {
                error!(rid, collection = other, "unsupported host identity source, skip the batch");
                Ok(Vec::new())
            }
        }
    }
}

fn host_id_doc(host_id: i64) -> Value {
    json!({ HOST_ID_FIELD: host_id })
}

/// Keeps the first non delete event of every host whose identity may have
/// changed. A deleted host has no identity left to watch.
pub(super) fn rearrange_host_events(
    events: Vec<ChangeEvent>,
    rid: &str,
) -> Vec<ChangeEvent> {
    let mut hit = HashSet::new();
    events
        .into_iter()
        .filter(|e| {
            if e.is_delete() {
                debug!(rid, oid = %e.oid, "skip deleted host");
                return false;
            }
            if hit.contains(&e.oid) {
                debug!(rid, event = %e.id(), "host event aggregated");
                return false;
            }

            let cared = match &e.change_desc {
                None => true,
                Some(desc) if desc.is_empty() => true,
                Some(desc) => CARED_HOST_FIELDS.iter().any(|f| desc.touches(f)),
            };
            if !cared {
                debug!(rid, event = %e.id(), "host change does not touch identity, skip");
                return false;
            }
            hit.insert(e.oid.clone());
            true
        })
        .collect()
}

impl HostIdentityRearranger {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Self {
        Self { docs, archive }
    }

    /// One event per host whose module placement changed. Deleted relations
    /// are resolved to their host through the archive.
    async fn rearrange_relation_events(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>> {
        let tenant = events[0].tenant_id.clone();
        let mut hit_hosts = HashSet::new();
        let mut hit = Vec::new();
        let mut deleted: HashMap<String, ChangeEvent> = HashMap::new();
        let mut delete_oids = Vec::new();

        for mut e in events {
            if e.is_delete() {
                delete_oids.push(e.oid.clone());
                deleted.insert(e.oid.clone(), e);
                continue;
            }

            let host_id = doc::get_i64(&e.document, HOST_ID_FIELD).unwrap_or(0);
            if host_id <= 0 {
                warn!(rid, event = %e.id(), "host relation without host id, skip");
                continue;
            }
            if !hit_hosts.insert(host_id) {
                debug!(rid, host_id, "host relation event aggregated");
                continue;
            }
            e.document = host_id_doc(host_id);
            hit.push(e);
        }

        if delete_oids.is_empty() {
            return Ok(hit);
        }

        let archived = self
            .archive
            .find_by_oids(&tenant, MODULE_HOST_CONFIG, &delete_oids)
            .await?;
        for a in archived {
            let host_id = doc::get_i64(&a.detail, HOST_ID_FIELD).unwrap_or(0);
            if host_id <= 0 {
                warn!(rid, oid = %a.oid, "archived host relation without host id, skip");
                continue;
            }
            if !hit_hosts.insert(host_id) {
                debug!(rid, host_id, oid = %a.oid, "deleted host relation aggregated");
                continue;
            }
            let Some(mut e) = deleted.remove(&a.oid) else {
                warn!(rid, oid = %a.oid, "archived relation matches no deleted event");
                continue;
            };
            e.document = host_id_doc(host_id);
            hit.push(e);
        }
        Ok(hit)
    }

    /// Redirects process events to the hosts running them.
    ///
    /// Hosts are found through live process relations first, then through
    /// archived relations for processes whose relation is already gone. The
    /// result has one event per host, never more than the unique process
    /// events it came from.
    async fn rearrange_process_events(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>> {
        let tenant = events[0].tenant_id.clone();
        let start = events[0].cluster_time.sec as i64;

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        let mut process_ids = Vec::new();
        let mut delete_oids = Vec::new();
        for e in events {
            if !seen.insert(e.oid.clone()) {
                debug!(rid, event = %e.id(), "process event aggregated");
                continue;
            }
            if e.is_delete() {
                delete_oids.push(e.oid.clone());
            } else {
                match doc::get_i64(&e.document, PROCESS_ID_FIELD) {
                    Some(id) if id > 0 => process_ids.push(id),
                    _ => warn!(rid, event = %e.id(), "process without process id"),
                }
            }
            unique.push(e);
        }

        if process_ids.is_empty() && delete_oids.is_empty() {
            return Ok(Vec::new());
        }

        let (not_hit, mut hosts) = self.process_hosts(&tenant, &process_ids).await?;
        if !not_hit.is_empty() {
            hosts.extend(self.archived_process_hosts(&tenant, start, &not_hit, rid).await?);
        }
        if !delete_oids.is_empty() {
            hosts.extend(self.deleted_process_hosts(&tenant, start, &delete_oids, rid).await?);
        }

        let mut hit_hosts = HashSet::new();
        hosts.retain(|h| hit_hosts.insert(*h));

        if hosts.len() > unique.len() {
            error!(
                rid,
                hosts = hosts.len(),
                events = unique.len(),
                "more hosts than process events, keep as many as events"
            );
        }
        let cnt = hosts.len().min(unique.len());
        unique.truncate(cnt);
        for (e, host_id) in unique.iter_mut().zip(hosts) {
            e.document = host_id_doc(host_id);
        }
        info!(rid, count = cnt, "process events redirected to hosts");
        Ok(unique)
    }

    /// Returns process ids without a live relation, and the hosts of the rest.
    async fn process_hosts(
        &self,
        tenant: &str,
        process_ids: &[i64],
    ) -> Result<(Vec<i64>, Vec<i64>)> {
        if process_ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let relations = self
            .docs
            .find_by_field_in(tenant, PROCESS_INSTANCE_RELATION, PROCESS_ID_FIELD, process_ids)
            .await?;

        let mut related = HashSet::new();
        let mut hosts = Vec::new();
        for r in &relations {
            if let Some(pid) = doc::get_i64(r, PROCESS_ID_FIELD) {
                related.insert(pid);
            }
            if let Some(host_id) = doc::get_i64(r, HOST_ID_FIELD) {
                hosts.push(host_id);
            }
        }
        let not_hit = process_ids.iter().copied().filter(|p| !related.contains(p)).collect();
        Ok((not_hit, hosts))
    }

    async fn archived_process_hosts(
        &self,
        tenant: &str,
        start: i64,
        process_ids: &[i64],
        rid: &str,
    ) -> Result<Vec<i64>> {
        let archived = self
            .archive
            .find_by_detail_field(
                tenant,
                PROCESS_INSTANCE_RELATION,
                PROCESS_ID_FIELD,
                process_ids,
                start - ARCHIVE_LOOKBACK_SECS,
            )
            .await?;
        if archived.len() != process_ids.len() {
            warn!(
                rid,
                ?process_ids,
                found = archived.len(),
                "not every process relation was found in the archive"
            );
        }
        Ok(archived
            .iter()
            .filter_map(|a| doc::get_i64(&a.detail, HOST_ID_FIELD))
            .collect())
    }

    async fn deleted_process_hosts(
        &self,
        tenant: &str,
        start: i64,
        oids: &[String],
        rid: &str,
    ) -> Result<Vec<i64>> {
        let process_ids: Vec<i64> = self
            .archive
            .find_by_oids(tenant, PROCESS, oids)
            .await?
            .iter()
            .filter_map(|a| doc::get_i64(&a.detail, PROCESS_ID_FIELD))
            .filter(|id| *id > 0)
            .collect();
        if process_ids.is_empty() {
            warn!(rid, ?oids, "no archived process found for deleted events");
            return Ok(Vec::new());
        }
        self.archived_process_hosts(tenant, start, &process_ids, rid).await
    }
}

/// Current identity of a host: its identity fields, module placements and
/// the processes bound to it. `None` once the host is gone.
pub async fn host_identity_detail(
    docs: &dyn DocumentStore,
    tenant: &str,
    host_id: i64,
) -> Result<Option<Value>> {
    let Some(host) = docs
        .find_by_field_in(tenant, HOST_BASE, HOST_ID_FIELD, &[host_id])
        .await?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };

    let mut identity = Map::new();
    for f in CARED_HOST_FIELDS {
        identity.insert(f.to_string(), host.get(f).cloned().unwrap_or(Value::Null));
    }
    identity.insert(
        "bk_host_name".to_string(),
        host.get("bk_host_name").cloned().unwrap_or(Value::Null),
    );

    let associations: Vec<Value> = docs
        .find_by_field_in(tenant, MODULE_HOST_CONFIG, HOST_ID_FIELD, &[host_id])
        .await?
        .iter()
        .map(|r| {
            json!({
                "bk_biz_id": r.get("bk_biz_id").cloned().unwrap_or(Value::Null),
                "bk_set_id": r.get("bk_set_id").cloned().unwrap_or(Value::Null),
                "bk_module_id": r.get("bk_module_id").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    identity.insert("associations".to_string(), Value::Array(associations));

    let process_ids: Vec<i64> = docs
        .find_by_field_in(tenant, PROCESS_INSTANCE_RELATION, HOST_ID_FIELD, &[host_id])
        .await?
        .iter()
        .filter_map(|r| doc::get_i64(r, PROCESS_ID_FIELD))
        .collect();
    let processes: Vec<Value> = if process_ids.is_empty() {
        Vec::new()
    } else {
        docs.find_by_field_in(tenant, PROCESS, PROCESS_ID_FIELD, &process_ids)
            .await?
            .iter()
            .map(|p| {
                let fields: Map<String, Value> = PROCESS_IDENTITY_FIELDS
                    .iter()
                    .map(|f| (f.to_string(), p.get(*f).cloned().unwrap_or(Value::Null)))
                    .collect();
                Value::Object(fields)
            })
            .collect()
    };
    identity.insert("process".to_string(), Value::Array(processes));

    Ok(Some(Value::Object(identity)))
}
