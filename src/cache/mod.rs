//! Local, durable id → record store.
//!
//! Content addressing makes every write idempotent: a record is never
//! updated once stored, so a repeated `put` of the same id is a no-op.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::ObjectId;

mod memory;
mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::{default_cache_path, CacheOptions, SqliteCache};

/// Rows fetched per page by [`CacheScan`].
pub const SCAN_PAGE_SIZE: usize = 512;

/// Failure of a [`LocalCache`] call.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The database stayed locked for longer than the configured timeout.
    #[error("cache database busy after waiting {waited:?}")]
    Busy { waited: Duration },
    /// The SQLite engine reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The database file or its directory is unusable.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A stored row cannot be read back.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
    /// The cache could not be opened at all.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl CacheError {
    /// True for [`CacheError::Busy`].
    pub fn is_busy(&self) -> bool {
        matches!(self, CacheError::Busy { .. })
    }
}

/// A durable key-value store of records keyed by content id.
///
/// Calls may block; async callers run them on the blocking pool.
pub trait LocalCache: Send + Sync {
    /// True when `id` is stored.
    fn has(&self, id: &ObjectId) -> Result<bool, CacheError>;

    /// The subset of `ids` present in the store.
    fn has_many(&self, ids: &[ObjectId]) -> Result<HashSet<ObjectId>, CacheError>;

    /// Stored JSON for `id`.
    fn get(&self, id: &ObjectId) -> Result<Option<String>, CacheError>;

    /// Stores one record; a present id is left as is.
    fn put(&self, id: &ObjectId, json: &str) -> Result<(), CacheError>;

    /// Stores a batch atomically and returns how many ids were new.
    ///
    /// A failure leaves earlier batches untouched and this one absent.
    fn put_batch(&self, items: &[(ObjectId, String)]) -> Result<usize, CacheError>;

    /// Up to `limit` entries with ids strictly greater than `after`, in id order.
    fn scan_page(
        &self,
        after: Option<&ObjectId>,
        limit: usize,
    ) -> Result<Vec<(ObjectId, String)>, CacheError>;

    /// Lazily walks every entry in id order.
    fn enumerate(&self) -> CacheScan<'_>;

    /// Number of stored records.
    fn len(&self) -> Result<u64, CacheError>;

    /// True when nothing is stored.
    fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Sum of the stored record sizes in bytes.
    fn total_bytes(&self) -> Result<u64, CacheError>;
}

/// Keyset-paginated iterator over a [`LocalCache`].
pub struct CacheScan<'a> {
    cache: &'a dyn LocalCache,
    page_size: usize,
    after: Option<ObjectId>,
    buffered: VecDeque<(ObjectId, String)>,
    exhausted: bool,
}

impl<'a> CacheScan<'a> {
    /// Scans `cache` in pages of [`SCAN_PAGE_SIZE`].
    pub fn new(cache: &'a dyn LocalCache) -> Self {
        Self::with_page_size(cache, SCAN_PAGE_SIZE)
    }

    /// Scans `cache` in pages of `page_size` rows.
    pub fn with_page_size(cache: &'a dyn LocalCache, page_size: usize) -> Self {
        Self {
            cache,
            page_size: page_size.max(1),
            after: None,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl Iterator for CacheScan<'_> {
    type Item = Result<(ObjectId, String), CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            match self.cache.scan_page(self.after.as_ref(), self.page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    if let Some((last, _)) = page.last() {
                        self.after = Some(last.clone());
                    }
                    self.buffered.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}
