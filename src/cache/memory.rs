use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use super::{CacheError, CacheScan, LocalCache};
use crate::types::ObjectId;

/// In-process cache backed by a sharded map.
///
/// Counts the records it actually stored, which makes it the natural store
/// for dedup assertions in tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    objects: DashMap<ObjectId, String>,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records newly stored since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Makes every subsequent write fail with [`CacheError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }

    fn insert(&self, id: &ObjectId, json: &str) -> bool {
        if self.objects.contains_key(id) {
            return false;
        }
        let inserted = self.objects.insert(id.clone(), json.to_string()).is_none();
        if inserted {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }
}

impl LocalCache for MemoryCache {
    fn has(&self, id: &ObjectId) -> Result<bool, CacheError> {
        Ok(self.objects.contains_key(id))
    }

    fn has_many(&self, ids: &[ObjectId]) -> Result<HashSet<ObjectId>, CacheError> {
        Ok(ids
            .iter()
            .filter(|id| self.objects.contains_key(*id))
            .cloned()
            .collect())
    }

    fn get(&self, id: &ObjectId) -> Result<Option<String>, CacheError> {
        Ok(self.objects.get(id).map(|entry| entry.value().clone()))
    }

    fn put(&self, id: &ObjectId, json: &str) -> Result<(), CacheError> {
        self.check_writable()?;
        self.insert(id, json);
        Ok(())
    }

    fn put_batch(&self, items: &[(ObjectId, String)]) -> Result<usize, CacheError> {
        self.check_writable()?;
        Ok(items
            .iter()
            .filter(|(id, json)| self.insert(id, json))
            .count())
    }

    fn scan_page(
        &self,
        after: Option<&ObjectId>,
        limit: usize,
    ) -> Result<Vec<(ObjectId, String)>, CacheError> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| after.map_or(true, |after| id > after))
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let json = self.objects.get(&id)?.value().clone();
                Some((id, json))
            })
            .collect())
    }

    fn enumerate(&self) -> CacheScan<'_> {
        CacheScan::new(self)
    }

    fn len(&self) -> Result<u64, CacheError> {
        Ok(self.objects.len() as u64)
    }

    fn total_bytes(&self) -> Result<u64, CacheError> {
        Ok(self
            .objects
            .iter()
            .map(|entry| entry.value().len() as u64)
            .sum())
    }
}
