use std::collections::HashMap;

use serde_json::json;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::projection::project_fields;
use super::projection::stored_detail;
use crate::biz_set_relation_detail;
use crate::host_identity_detail;
use crate::metrics::alarm;
use crate::metrics::STORE_ERRORS;
use crate::ChainNode;
use crate::CursorType;
use crate::EventType;
use crate::Key;
use crate::MixSnapshots;
use crate::Result;
use crate::Stores;
use crate::BIZ_IDS_FIELD;
use crate::BIZ_SET;
use crate::BIZ_SET_ID_FIELD;

/// Resolves the details of chain nodes.
///
/// Cached details are read in one multi-get. Misses are rebuilt from the
/// live documents (or the archive, for deletes). Host identities are always
/// built from the documents; biz set relations are rebuilt from the biz set's
/// current scope.
#[derive(Clone)]
pub struct DetailLoader {
    stores: Stores,
    snapshots: MixSnapshots,
}

impl DetailLoader {
    pub fn new(
        stores: Stores,
        snapshots: MixSnapshots,
    ) -> Self {
        Self { stores, snapshots }
    }

    /// Details aligned with `nodes`; `None` where no detail could be found.
    pub async fn load(
        &self,
        key: &Key,
        tenant: &str,
        fields: &[String],
        nodes: &[ChainNode],
    ) -> Result<Vec<Option<Value>>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        match key.resource() {
            CursorType::HostIdentifier => self.host_identities(tenant, nodes).await,
            CursorType::BizSetRelation => self.biz_set_relations(key, tenant, nodes).await,
            _ => self.cached_or_rebuilt(key, tenant, fields, nodes).await,
        }
    }

    /// Cached details of `cursors`, no fallback.
    pub async fn cached(
        &self,
        key: &Key,
        tenant: &str,
        cursors: &[String],
    ) -> Result<Vec<Option<Value>>> {
        let keys: Vec<String> = cursors.iter().map(|c| key.detail_key(tenant, c)).collect();
        let raw = match self.stores.cache.mget(&keys).await {
            Ok(raw) => raw,
            Err(e) => {
                STORE_ERRORS.with_label_values(&[key.resource().as_str(), "cache"]).inc();
                return Err(e);
            }
        };
        Ok(raw.into_iter().map(|r| r.as_deref().and_then(stored_detail)).collect())
    }

    async fn cached_or_rebuilt(
        &self,
        key: &Key,
        tenant: &str,
        fields: &[String],
        nodes: &[ChainNode],
    ) -> Result<Vec<Option<Value>>> {
        let cursors: Vec<String> = nodes.iter().map(|n| n.cursor.clone()).collect();
        let mut details: Vec<Option<Value>> = self
            .cached(key, tenant, &cursors)
            .await?
            .into_iter()
            .map(|d| d.map(|d| project_fields(d, fields)))
            .collect();

        let missed: Vec<usize> = (0..nodes.len()).filter(|i| details[*i].is_none()).collect();
        if missed.is_empty() {
            return Ok(details);
        }
        debug!(
            resource = %key.resource(),
            missed = missed.len(),
            "event details missing in cache, rebuild from documents"
        );

        let (deleted, live): (Vec<usize>, Vec<usize>) =
            missed.into_iter().partition(|i| nodes[*i].event_type == EventType::Delete);

        let live_oids: Vec<String> = live.iter().map(|i| nodes[*i].oid.clone()).collect();
        let deleted_oids: Vec<String> = deleted.iter().map(|i| nodes[*i].oid.clone()).collect();
        let mut live_docs: HashMap<String, Value> = HashMap::new();
        let mut archived_docs: HashMap<String, Value> = HashMap::new();

        for coll in key.collections() {
            if !live_oids.is_empty() {
                for (oid, doc) in self.stores.docs.find_by_oids(tenant, coll, &live_oids).await? {
                    live_docs.insert(oid, doc);
                }
            }
            if !deleted_oids.is_empty() {
                for archived in self.stores.archive.find_by_oids(tenant, coll, &deleted_oids).await? {
                    archived_docs.insert(archived.oid, archived.detail);
                }
            }
        }

        for i in live {
            details[i] = live_docs.get(&nodes[i].oid).map(|d| project_fields(d.clone(), fields));
        }
        for i in deleted {
            details[i] = archived_docs.get(&nodes[i].oid).map(|d| project_fields(d.clone(), fields));
        }
        Ok(details)
    }

    async fn host_identities(
        &self,
        tenant: &str,
        nodes: &[ChainNode],
    ) -> Result<Vec<Option<Value>>> {
        let mut identities: HashMap<i64, Option<Value>> = HashMap::new();
        for node in nodes {
            if node.instance_id <= 0 {
                error!(cursor = %node.cursor, instance_id = node.instance_id, "host identity node with invalid host id, skip");
                alarm(CursorType::HostIdentifier.as_str(), "invalid_host_id");
                continue;
            }
            if identities.contains_key(&node.instance_id) {
                continue;
            }
            let identity = host_identity_detail(self.stores.docs.as_ref(), tenant, node.instance_id).await?;
            identities.insert(node.instance_id, identity);
        }

        Ok(nodes
            .iter()
            .map(|n| identities.get(&n.instance_id).cloned().flatten())
            .collect())
    }

    async fn biz_set_relations(
        &self,
        key: &Key,
        tenant: &str,
        nodes: &[ChainNode],
    ) -> Result<Vec<Option<Value>>> {
        let cursors: Vec<String> = nodes.iter().map(|n| n.cursor.clone()).collect();
        let mut details = self.cached(key, tenant, &cursors).await?;

        let mut missed_ids: Vec<i64> = nodes
            .iter()
            .zip(&details)
            .filter(|(_, d)| d.is_none())
            .map(|(n, _)| n.instance_id)
            .collect();
        if missed_ids.is_empty() {
            return Ok(details);
        }
        missed_ids.sort_unstable();
        missed_ids.dedup();

        let mut rebuilt: HashMap<i64, Value> = HashMap::new();
        for biz_set in self
            .stores
            .docs
            .find_by_field_in(tenant, BIZ_SET, BIZ_SET_ID_FIELD, &missed_ids)
            .await?
        {
            let detail = biz_set_relation_detail(self.stores.docs.as_ref(), &self.snapshots, tenant, &biz_set).await?;
            if let Some(id) = detail.get(BIZ_SET_ID_FIELD).and_then(Value::as_i64) {
                rebuilt.insert(id, detail);
            }
        }

        for (node, detail) in nodes.iter().zip(details.iter_mut()) {
            if detail.is_some() {
                continue;
            }
            // a deleted biz set has no biz left
            let relation = rebuilt.get(&node.instance_id).cloned().unwrap_or_else(|| {
                warn!(biz_set = node.instance_id, "biz set not found, relation detail is empty");
                json!({ BIZ_SET_ID_FIELD: node.instance_id, BIZ_IDS_FIELD: [] })
            });
            *detail = Some(relation);
        }
        Ok(details)
    }
}
