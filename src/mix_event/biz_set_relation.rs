use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::scope::match_biz;
use super::scope::BizSetScope;
use super::scope::MATCH_ALL_FIELD;
use super::scope::SCOPE_FIELD;
use super::snapshot::load_all_biz;
use super::snapshot::MixSnapshots;
use super::Rearranger;
use crate::delete_details;
use crate::event::doc;
use crate::ArchiveStore;
use crate::ChangeEvent;
use crate::DocumentStore;
use crate::OperType;
use crate::Result;
use crate::BIZ;
use crate::BIZ_SET;

pub const BIZ_SET_ID_FIELD: &str = "bk_biz_set_id";
pub const BIZ_IDS_FIELD: &str = "bk_biz_ids";
const DATA_STATUS_FIELD: &str = "bk_data_status";
const OID_FIELD: &str = "_id";
const BIZ_SET_PAGE_SIZE: usize = 500;

/// Turns biz set and biz events into "biz set relation changed" events.
///
/// Biz set events pass when their scope may have changed. A biz event is
/// redirected to every biz set whose scope it enters, leaves or may affect.
pub struct BizSetRelationRearranger {
    docs: Arc<dyn DocumentStore>,
    archive: Arc<dyn ArchiveStore>,
    snapshots: MixSnapshots,
}

#[async_trait]
impl Rearranger for BizSetRelationRearranger {
    async fn rearrange(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>> {
        let (biz_sets, rest): (Vec<_>, Vec<_>) = events.into_iter().partition(|e| e.collection == BIZ_SET);
        let (biz, other): (Vec<_>, Vec<_>) = rest.into_iter().partition(|e| e.collection == BIZ);
        if !other.is_empty() {
            error!(rid, count = other.len(), "unsupported biz set relation source events, skip");
        }

        let mut hit = self.rearrange_biz_set_events(biz_sets, rid).await?;
        hit.extend(self.rearrange_biz_events(biz, rid).await?);
        Ok(hit)
    }

    /// Biz ids currently in the scope of the event's biz set.
    async fn detail(
        &self,
        event: &ChangeEvent,
        _rid: &str,
    ) -> Result<Option<Value>> {
        let biz_set_id = doc::get_i64(&event.document, BIZ_SET_ID_FIELD).unwrap_or(0);
        if biz_set_id <= 0 {
            return Ok(None);
        }
        let detail = if event.is_delete() {
            json!({ BIZ_SET_ID_FIELD: biz_set_id, BIZ_IDS_FIELD: [] })
        } else {
            biz_set_relation_detail(self.docs.as_ref(), &self.snapshots, &event.tenant_id, &event.document).await?
        };
        Ok(Some(detail))
    }
}

/// Per tenant inputs of biz event conversion.
#[derive(Default)]
struct BizChanges {
    /// Inserted, deleted, enabled or disabled biz with the index of their event
    entered_or_left: Vec<(Value, usize)>,
    /// Cared field to the index of the first event updating it
    updated_fields: HashMap<String, usize>,
}

impl BizSetRelationRearranger {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        archive: Arc<dyn ArchiveStore>,
        snapshots: MixSnapshots,
    ) -> Self {
        Self {
            docs,
            archive,
            snapshots,
        }
    }

    /// Collapses the events of each biz set by its last event in the batch:
    /// create then delete vanishes, create then update becomes a create with
    /// the updated document, update then delete becomes the delete. Updates
    /// pass only when they may touch the scope.
    async fn rearrange_biz_set_events(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>> {
        if events.is_empty() {
            return Ok(events);
        }
        let archived = delete_details(self.archive.as_ref(), &events).await?;

        let unique_key = |e: &ChangeEvent| format!("{}-{}-{}", e.tenant_id, e.collection, e.oid);
        let mut last_events: HashMap<String, (OperType, Value)> = HashMap::new();
        for e in events.iter().rev() {
            last_events
                .entry(unique_key(e))
                .or_insert_with(|| (e.operation_type.clone(), e.document.clone()));
        }

        let mut hit = Vec::new();
        let mut ignored = HashSet::new();
        for mut e in events {
            let key = unique_key(&e);
            if ignored.contains(&key) {
                debug!(rid, event = %e.id(), "biz set event aggregated");
                continue;
            }
            let Some((last_oper, last_doc)) = last_events.get(&key) else {
                continue;
            };

            let (keep, ignore_rest) = match e.operation_type {
                OperType::Insert => {
                    match last_oper {
                        OperType::Delete => (false, true),
                        OperType::Update | OperType::Replace => {
                            e.document = last_doc.clone();
                            (true, true)
                        }
                        _ => (true, true),
                    }
                }
                OperType::Delete => {
                    if e.document.is_null() {
                        if let Some(d) = archived.get(&(e.collection.clone(), e.oid.clone())) {
                            e.document = d.clone();
                        }
                    }
                    (true, true)
                }
                OperType::Update | OperType::Replace => {
                    if *last_oper == OperType::Delete {
                        (false, false)
                    } else if e.change_desc_is_empty() {
                        (true, true)
                    } else {
                        let touched = e.change_desc.as_ref().map(|d| d.touches(SCOPE_FIELD)).unwrap_or(false);
                        if !touched {
                            debug!(rid, event = %e.id(), "biz set change does not touch scope, skip");
                        }
                        (touched, touched)
                    }
                }
                ref other => {
                    error!(rid, oper = other.as_str(), "biz set event with invalid operation");
                    (false, false)
                }
            };

            if ignore_rest {
                ignored.insert(key);
            }
            if keep {
                hit.push(e);
            }
        }

        let mut match_all_tenants: Vec<String> = hit
            .iter()
            .filter(|e| !e.is_delete())
            .filter(|e| doc::get_path(&e.document, &format!("{SCOPE_FIELD}.{MATCH_ALL_FIELD}")) == Some(&Value::Bool(true)))
            .map(|e| e.tenant_id.clone())
            .collect();
        match_all_tenants.sort();
        match_all_tenants.dedup();
        for tenant in match_all_tenants {
            self.snapshots.all_biz_ids.refresh(self.docs.as_ref(), &tenant).await?;
        }

        Ok(hit)
    }

    async fn rearrange_biz_events(
        &self,
        events: Vec<ChangeEvent>,
        rid: &str,
    ) -> Result<Vec<ChangeEvent>> {
        if events.is_empty() {
            return Ok(events);
        }
        let archived = delete_details(self.archive.as_ref(), &events).await?;
        let changes = self.collect_biz_changes(&events, &archived, rid);
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        // event index -> biz sets redirected to it
        let mut related: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
        for (tenant, change) in &changes {
            let care_fields = self.snapshots.care_fields.get(tenant);
            let mut has_match_all = false;

            for biz_set in load_all_biz_sets(self.docs.as_ref(), tenant).await? {
                let Some(scope) = BizSetScope::from_doc(&biz_set) else {
                    warn!(rid, biz_set = %biz_set, "biz set without a valid scope, skip");
                    continue;
                };

                if scope.match_all {
                    // only biz entering or leaving can change a match-all relation
                    if let Some((_, index)) = change.entered_or_left.first() {
                        related.entry(*index).or_default().push(biz_set);
                        has_match_all = true;
                    }
                    continue;
                }

                let Some(filter) = &scope.filter else {
                    warn!(rid, biz_set = %biz_set, "biz set scope without filter, skip");
                    continue;
                };

                // updates can not tell the former value, so any rule on an
                // updated field counts as a hit
                let mut first: Option<usize> = None;
                filter.match_any(&mut |rule| match change.updated_fields.get(&rule.field) {
                    Some(index) => {
                        first = Some(first.map_or(*index, |f| f.min(*index)));
                        true
                    }
                    None => false,
                });

                for (biz, index) in &change.entered_or_left {
                    if first.is_some_and(|f| *index >= f) {
                        break;
                    }
                    if filter.matches(&mut |rule| match_biz(rule, biz, &care_fields)) {
                        first = Some(*index);
                        break;
                    }
                }

                if let Some(index) = first {
                    related.entry(index).or_default().push(biz_set);
                }
            }

            if has_match_all {
                self.snapshots.all_biz_ids.refresh(self.docs.as_ref(), tenant).await?;
            }
        }

        let mut hit = Vec::new();
        for (index, biz_sets) in related {
            let biz_event = &events[index];
            for biz_set in biz_sets {
                let oid = biz_set_oid(&biz_set);
                hit.push(ChangeEvent {
                    oid,
                    document: biz_set,
                    operation_type: OperType::Update,
                    collection: BIZ_SET.to_string(),
                    tenant_id: biz_event.tenant_id.clone(),
                    cluster_time: biz_event.cluster_time,
                    token: biz_event.token.clone(),
                    change_desc: None,
                });
            }
        }
        info!(rid, biz_events = events.len(), biz_set_events = hit.len(), "biz events redirected to biz sets");
        Ok(hit)
    }

    fn collect_biz_changes(
        &self,
        events: &[ChangeEvent],
        archived: &crate::DeleteDetails,
        rid: &str,
    ) -> BTreeMap<String, BizChanges> {
        let mut changes: BTreeMap<String, BizChanges> = BTreeMap::new();

        for (index, e) in events.iter().enumerate() {
            let tenant = e.tenant_id.clone();
            match e.operation_type {
                OperType::Insert | OperType::Delete => {
                    let document = if e.is_delete() && e.document.is_null() {
                        archived.get(&(e.collection.clone(), e.oid.clone())).cloned()
                    } else {
                        Some(e.document.clone())
                    };
                    match document {
                        Some(d) if d.is_object() => {
                            changes.entry(tenant).or_default().entered_or_left.push((d, index));
                        }
                        _ => warn!(rid, event = %e.id(), "biz event without document, skip"),
                    }
                }
                OperType::Update | OperType::Replace => {
                    let care_fields = self.snapshots.care_fields.get(&tenant);
                    let change = changes.entry(tenant).or_default();

                    let Some(desc) = e.change_desc.as_ref().filter(|d| !d.is_empty()) else {
                        for field in care_fields.keys() {
                            change.updated_fields.entry(field.clone()).or_insert(index);
                        }
                        continue;
                    };

                    // archiving a biz leaves every biz set, recovering enters them
                    let status = desc.updated_fields.get(DATA_STATUS_FIELD).and_then(Value::as_str);
                    if matches!(status, Some("disabled") | Some("enable")) {
                        change.entered_or_left.push((e.document.clone(), index));
                        continue;
                    }

                    let mut cared = false;
                    let touched = desc.updated_fields.keys().chain(desc.removed_fields.iter());
                    for field in touched {
                        if care_fields.contains_key(field) {
                            change.updated_fields.entry(field.clone()).or_insert(index);
                            cared = true;
                        }
                    }
                    if !cared {
                        debug!(rid, event = %e.id(), "biz change does not touch cared fields, skip");
                    }
                }
                ref other => error!(rid, oper = other.as_str(), "biz event with invalid operation"),
            }
        }

        changes.retain(|_, c| !c.entered_or_left.is_empty() || !c.updated_fields.is_empty());
        changes
    }
}

fn biz_set_oid(biz_set: &Value) -> String {
    match biz_set.get(OID_FIELD) {
        Some(Value::String(s)) => s.clone(),
        _ => doc::get_i64(biz_set, BIZ_SET_ID_FIELD).unwrap_or(0).to_string(),
    }
}

/// Every biz set of `tenant`, paged by biz set id.
pub async fn load_all_biz_sets(
    docs: &dyn DocumentStore,
    tenant: &str,
) -> Result<Vec<Value>> {
    let mut all = Vec::new();
    let mut after = 0;
    loop {
        let page = docs
            .find_page(tenant, BIZ_SET, BIZ_SET_ID_FIELD, after, BIZ_SET_PAGE_SIZE)
            .await?;
        let n = page.len();
        if let Some(last) = page.last().and_then(|d| doc::get_i64(d, BIZ_SET_ID_FIELD)) {
            after = last;
        }
        all.extend(page);
        if n < BIZ_SET_PAGE_SIZE {
            return Ok(all);
        }
    }
}

/// `{"bk_biz_set_id": N, "bk_biz_ids": [..]}` for the current scope of a biz set.
///
/// Match-all biz sets use the all-biz-ids snapshot, loading it on first use.
pub async fn biz_set_relation_detail(
    docs: &dyn DocumentStore,
    snapshots: &MixSnapshots,
    tenant: &str,
    biz_set: &Value,
) -> Result<Value> {
    let biz_set_id = doc::get_i64(biz_set, BIZ_SET_ID_FIELD).unwrap_or(0);
    let scope = BizSetScope::from_doc(biz_set).unwrap_or_default();

    let biz_ids: Vec<i64> = if scope.match_all {
        match snapshots.all_biz_ids.get(tenant) {
            Some(ids) => ids.as_ref().clone(),
            None => snapshots.all_biz_ids.refresh(docs, tenant).await?.as_ref().clone(),
        }
    } else if let Some(filter) = &scope.filter {
        let care_fields = snapshots.care_fields.get(tenant);
        load_all_biz(docs, tenant)
            .await?
            .iter()
            .filter(|b| doc::get_str(b, DATA_STATUS_FIELD) != Some("disabled"))
            .filter(|b| filter.matches(&mut |rule| match_biz(rule, b, &care_fields)))
            .filter_map(|b| doc::get_i64(b, "bk_biz_id"))
            .collect()
    } else {
        Vec::new()
    };

    Ok(json!({ BIZ_SET_ID_FIELD: biz_set_id, BIZ_IDS_FIELD: biz_ids }))
}
