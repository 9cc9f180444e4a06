use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::DetailCache;
use crate::Result;

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, (String, Instant)>,
    /// expire_at -> keys expiring at that instant
    expirations: BTreeMap<Instant, Vec<String>>,
}

impl Entries {
    fn insert(
        &mut self,
        key: String,
        value: String,
        expire_at: Instant,
    ) {
        self.unregister(&key);
        self.expirations.entry(expire_at).or_default().push(key.clone());
        self.values.insert(key, (value, expire_at));
    }

    fn unregister(
        &mut self,
        key: &str,
    ) {
        if let Some((_, expire_at)) = self.values.remove(key) {
            if let Some(keys) = self.expirations.get_mut(&expire_at) {
                keys.retain(|k| k != key);
                if keys.is_empty() {
                    self.expirations.remove(&expire_at);
                }
            }
        }
    }

    fn purge_expired(
        &mut self,
        now: Instant,
    ) -> usize {
        let expired_times: Vec<Instant> =
            self.expirations.range(..=now).map(|(time, _)| *time).collect();
        let mut purged = 0;
        for time in expired_times {
            if let Some(keys) = self.expirations.remove(&time) {
                for key in keys {
                    self.values.remove(&key);
                    purged += 1;
                }
            }
        }
        purged
    }

    fn get(
        &self,
        key: &str,
        now: Instant,
    ) -> Option<String> {
        match self.values.get(key) {
            Some((value, expire_at)) if *expire_at > now => Some(value.clone()),
            _ => None,
        }
    }
}

/// In-memory TTL cache standing in for the shared fast cache.
///
/// Expired entries are never returned; they are physically dropped on the
/// next write or by [`MemDetailCache::purge_expired`].
#[derive(Debug, Default)]
pub struct MemDetailCache {
    entries: Mutex<Entries>,
}

impl MemDetailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.lock().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops a key as if it had been evicted.
    pub fn evict(
        &self,
        key: &str,
    ) {
        self.entries.lock().unregister(key);
    }
}

#[async_trait]
impl DetailCache for MemDetailCache {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key, Instant::now()))
    }

    async fn mget(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<String>>> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(keys.iter().map(|k| entries.get(k, now)).collect())
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.purge_expired(now);
        entries.insert(key.to_string(), value, now + ttl);
        Ok(())
    }

    async fn set_many(
        &self,
        items: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()> {
        trace!("cache pipeline set {} entries", items.len());
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.purge_expired(now);
        for (key, value) in items {
            entries.insert(key, value, now + ttl);
        }
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.purge_expired(now);
        if entries.get(key, now).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), value, now + ttl);
        Ok(true)
    }

    async fn del(
        &self,
        key: &str,
    ) -> Result<()> {
        self.entries.lock().unregister(key);
        Ok(())
    }
}
