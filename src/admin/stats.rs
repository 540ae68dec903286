use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_cache;
use crate::admin::Result;
use crate::cache::LocalCache;

/// Discriminator reported for records without a `speckle_type`.
const UNTYPED: &str = "<untyped>";

/// Output of [`stats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Record counts and sizes.
    pub cache: CacheStatsSection,
    /// On-disk footprint.
    pub filesystem: FilesystemStats,
}

/// What the cache holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatsSection {
    /// Stored records.
    pub records: u64,
    /// Sum of record JSON lengths in bytes.
    pub content_bytes: u64,
    /// Length of the largest record in bytes.
    pub largest_record_bytes: u64,
    /// Records whose JSON could not be read.
    pub unreadable: u64,
    /// Record count per type discriminator, sorted by name.
    pub types: BTreeMap<String, u64>,
}

/// Database and write-ahead log files.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Path of the database file.
    pub db_path: String,
    /// Size of the database file.
    pub db_size_bytes: u64,
    /// Path of the write-ahead log.
    pub wal_path: String,
    /// Size of the write-ahead log, zero when absent.
    pub wal_size_bytes: u64,
}

#[derive(Deserialize)]
struct TypeOnly {
    speckle_type: Option<String>,
}

/// Scans every record of `cache`.
pub fn cache_stats(cache: &dyn LocalCache) -> Result<CacheStatsSection> {
    let mut section = CacheStatsSection::default();
    for entry in cache.enumerate() {
        let (_, json) = entry?;
        let size = json.len() as u64;
        section.records += 1;
        section.content_bytes += size;
        section.largest_record_bytes = section.largest_record_bytes.max(size);
        match serde_json::from_str::<TypeOnly>(&json) {
            Ok(parsed) => {
                let name = parsed.speckle_type.unwrap_or_else(|| UNTYPED.to_string());
                *section.types.entry(name).or_default() += 1;
            }
            Err(_) => section.unreadable += 1,
        }
    }
    Ok(section)
}

/// Collects record and file statistics for the cache at `path`.
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let cache = open_cache(path, opts)?;
    let cache_section = cache_stats(&cache)?;

    let db_meta = fs::metadata(path)?;
    let wal_path = cache.wal_path();
    let wal_size = fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);

    Ok(StatsReport {
        cache: cache_section,
        filesystem: FilesystemStats {
            db_path: path.display().to_string(),
            db_size_bytes: db_meta.len(),
            wal_path: wal_path.display().to_string(),
            wal_size_bytes: wal_size,
        },
    })
}
