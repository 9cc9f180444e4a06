use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::event::doc;
use crate::DocumentStore;
use crate::Result;

type CollKey = (String, String);

/// In-memory document collections keyed by `(tenant, collection)`.
#[derive(Debug, Default)]
pub struct MemDocumentStore {
    collections: DashMap<CollKey, BTreeMap<String, Value>>,
}

impl MemDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(
        &self,
        tenant: &str,
        coll: &str,
        oid: &str,
        doc: Value,
    ) {
        self.collections
            .entry((tenant.to_string(), coll.to_string()))
            .or_default()
            .insert(oid.to_string(), doc);
    }

    pub fn remove(
        &self,
        tenant: &str,
        coll: &str,
        oid: &str,
    ) -> Option<Value> {
        self.collections
            .get_mut(&(tenant.to_string(), coll.to_string()))
            .and_then(|mut c| c.remove(oid))
    }

    fn scan<F>(
        &self,
        tenant: &str,
        coll: &str,
        pred: F,
    ) -> Vec<Value>
    where
        F: Fn(&Value) -> bool,
    {
        self.collections
            .get(&(tenant.to_string(), coll.to_string()))
            .map(|c| c.values().filter(|d| pred(d)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemDocumentStore {
    async fn find_by_oids(
        &self,
        tenant: &str,
        coll: &str,
        oids: &[String],
    ) -> Result<Vec<(String, Value)>> {
        let Some(c) = self.collections.get(&(tenant.to_string(), coll.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(oids
            .iter()
            .filter_map(|oid| c.get(oid).map(|d| (oid.clone(), d.clone())))
            .collect())
    }

    async fn find_by_field_in(
        &self,
        tenant: &str,
        coll: &str,
        field: &str,
        values: &[i64],
    ) -> Result<Vec<Value>> {
        Ok(self.scan(tenant, coll, |d| {
            doc::get_i64(d, field).map(|v| values.contains(&v)).unwrap_or(false)
        }))
    }

    async fn find_by_field_eq(
        &self,
        tenant: &str,
        coll: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>> {
        Ok(self.scan(tenant, coll, |d| doc::get_path(d, field) == Some(value)))
    }

    async fn find_page(
        &self,
        tenant: &str,
        coll: &str,
        sort_field: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let mut sorted: HashMap<i64, Value> = HashMap::new();
        for d in self.scan(tenant, coll, |d| {
            doc::get_i64(d, sort_field).map(|v| v > after).unwrap_or(false)
        }) {
            if let Some(id) = doc::get_i64(&d, sort_field) {
                sorted.insert(id, d);
            }
        }
        let mut ids: Vec<i64> = sorted.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids.into_iter().take(limit).filter_map(|id| sorted.remove(&id)).collect())
    }
}
