use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::scope::FIELD_TYPE_ENUM;
use super::scope::FIELD_TYPE_INT;
use super::scope::FIELD_TYPE_ORGANIZATION;
use crate::event::doc;
use crate::utils::async_task::task_with_exponential_backoff;
use crate::BackoffPolicy;
use crate::DocumentStore;
use crate::Result;
use crate::BIZ;
use crate::OBJ_ATTRIBUTE;

pub const BIZ_ID_FIELD: &str = "bk_biz_id";
const DATA_STATUS_FIELD: &str = "bk_data_status";
const DEFAULT_FIELD: &str = "default";
const DISABLED: &str = "disabled";
const PAGE_SIZE: usize = 500;

/// Biz attribute name to property type.
pub type CareFields = HashMap<String, String>;

/// Per tenant biz attributes a biz set scope may filter on.
///
/// Readers get a consistent map without locking; refreshes swap in a new one.
#[derive(Default)]
pub struct CareFieldsSnapshot {
    inner: ArcSwap<HashMap<String, Arc<CareFields>>>,
}

impl CareFieldsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cared fields of `tenant`; before the first refresh only the biz id.
    pub fn get(
        &self,
        tenant: &str,
    ) -> Arc<CareFields> {
        self.inner
            .load()
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| Arc::new(base_care_fields()))
    }

    pub fn set(
        &self,
        tenant: &str,
        fields: CareFields,
    ) {
        let fields = Arc::new(fields);
        self.inner.rcu(|cur| {
            let mut next = HashMap::clone(cur);
            next.insert(tenant.to_string(), fields.clone());
            next
        });
    }
}

fn base_care_fields() -> CareFields {
    HashMap::from([(BIZ_ID_FIELD.to_string(), FIELD_TYPE_INT.to_string())])
}

/// Ids of every regular, enabled biz per tenant, used by match-all biz sets.
#[derive(Default)]
pub struct AllBizIdsSnapshot {
    inner: ArcSwap<HashMap<String, Arc<Vec<i64>>>>,
}

impl AllBizIdsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        tenant: &str,
    ) -> Option<Arc<Vec<i64>>> {
        self.inner.load().get(tenant).cloned()
    }

    pub fn set(
        &self,
        tenant: &str,
        ids: Vec<i64>,
    ) {
        let ids = Arc::new(ids);
        self.inner.rcu(|cur| {
            let mut next = HashMap::clone(cur);
            next.insert(tenant.to_string(), ids.clone());
            next
        });
    }

    /// Reloads the ids of `tenant` from the document store.
    pub async fn refresh(
        &self,
        docs: &dyn DocumentStore,
        tenant: &str,
    ) -> Result<Arc<Vec<i64>>> {
        let ids = load_all_biz_ids(docs, tenant).await?;
        debug!(tenant, count = ids.len(), "all biz ids refreshed");
        self.set(tenant, ids);
        Ok(self.get(tenant).unwrap_or_default())
    }
}

/// Snapshots shared by biz set relation ingestion and watch serving.
#[derive(Clone, Default)]
pub struct MixSnapshots {
    pub care_fields: Arc<CareFieldsSnapshot>,
    pub all_biz_ids: Arc<AllBizIdsSnapshot>,
}

/// Biz id plus every enum and organization attribute of the biz model.
pub async fn load_care_fields(
    docs: &dyn DocumentStore,
    tenant: &str,
) -> Result<CareFields> {
    let attrs = docs
        .find_by_field_eq(tenant, OBJ_ATTRIBUTE, "bk_obj_id", &json!("biz"))
        .await?;

    let mut fields = base_care_fields();
    for attr in attrs {
        let (Some(id), Some(ty)) = (
            doc::get_str(&attr, "bk_property_id"),
            doc::get_str(&attr, "bk_property_type"),
        ) else {
            continue;
        };
        if ty == FIELD_TYPE_ENUM || ty == FIELD_TYPE_ORGANIZATION {
            fields.insert(id.to_string(), ty.to_string());
        }
    }
    Ok(fields)
}

/// Every biz document of `tenant`, paged by biz id.
pub async fn load_all_biz(
    docs: &dyn DocumentStore,
    tenant: &str,
) -> Result<Vec<serde_json::Value>> {
    let mut all = Vec::new();
    let mut after = 0;
    loop {
        let page = docs.find_page(tenant, BIZ, BIZ_ID_FIELD, after, PAGE_SIZE).await?;
        let n = page.len();
        if let Some(last) = page.last().and_then(|d| doc::get_i64(d, BIZ_ID_FIELD)) {
            after = last;
        }
        all.extend(page);
        if n < PAGE_SIZE {
            return Ok(all);
        }
    }
}

/// Ids of biz that are neither the default biz nor disabled.
pub async fn load_all_biz_ids(
    docs: &dyn DocumentStore,
    tenant: &str,
) -> Result<Vec<i64>> {
    Ok(load_all_biz(docs, tenant)
        .await?
        .iter()
        .filter(|b| doc::get_i64(b, DEFAULT_FIELD).unwrap_or(0) == 0)
        .filter(|b| doc::get_str(b, DATA_STATUS_FIELD) != Some(DISABLED))
        .filter_map(|b| doc::get_i64(b, BIZ_ID_FIELD))
        .collect())
}

/// Reloads the cared biz fields of every tenant on an interval.
pub struct CareFieldsRefresher {
    docs: Arc<dyn DocumentStore>,
    tenants: Vec<String>,
    snapshot: Arc<CareFieldsSnapshot>,
    every: Duration,
    policy: BackoffPolicy,
}

impl CareFieldsRefresher {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        tenants: Vec<String>,
        snapshot: Arc<CareFieldsSnapshot>,
        every: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            docs,
            tenants,
            snapshot,
            every,
            policy,
        }
    }

    /// Refreshes every tenant; a tenant that keeps failing keeps its old fields.
    pub async fn refresh_once(&self) -> usize {
        let mut refreshed = 0;
        for tenant in &self.tenants {
            let docs = self.docs.clone();
            let loaded = task_with_exponential_backoff(
                "load_care_fields",
                || {
                    let docs = docs.clone();
                    let tenant = tenant.clone();
                    async move { load_care_fields(docs.as_ref(), &tenant).await }
                },
                self.policy,
            )
            .await;

            match loaded {
                Ok(fields) => {
                    debug!(tenant, ?fields, "care biz fields refreshed");
                    self.snapshot.set(tenant, fields);
                    refreshed += 1;
                }
                Err(e) => warn!(tenant, "refresh care biz fields failed: {:?}", e),
            }
        }
        refreshed
    }

    pub async fn run(
        self,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    info!("care fields refresher stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
            }
        }
    }
}
