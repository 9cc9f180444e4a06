use async_trait::async_trait;
use parking_lot::RwLock;

use crate::event::doc;
use crate::ArchiveDoc;
use crate::ArchiveStore;
use crate::Result;

/// In-memory delete archive, kept in archive order.
#[derive(Debug, Default)]
pub struct MemArchiveStore {
    docs: RwLock<Vec<ArchiveDoc>>,
}

impl MemArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArchiveStore for MemArchiveStore {
    async fn insert(
        &self,
        doc: ArchiveDoc,
    ) -> Result<()> {
        self.docs.write().push(doc);
        Ok(())
    }

    async fn find_by_oids(
        &self,
        tenant: &str,
        coll: &str,
        oids: &[String],
    ) -> Result<Vec<ArchiveDoc>> {
        Ok(self
            .docs
            .read()
            .iter()
            .filter(|d| d.tenant_id == tenant && d.coll == coll && oids.contains(&d.oid))
            .cloned()
            .collect())
    }

    async fn find_by_detail_field(
        &self,
        tenant: &str,
        coll: &str,
        field: &str,
        values: &[i64],
        created_after: i64,
    ) -> Result<Vec<ArchiveDoc>> {
        Ok(self
            .docs
            .read()
            .iter()
            .filter(|d| d.tenant_id == tenant && d.coll == coll && d.create_time >= created_after)
            .filter(|d| {
                doc::get_i64(&d.detail, field).map(|v| values.contains(&v)).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn delete_before(
        &self,
        before: i64,
        limit: usize,
    ) -> Result<usize> {
        let mut docs = self.docs.write();
        let mut removed = 0;
        docs.retain(|d| {
            if removed < limit && d.create_time < before {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
