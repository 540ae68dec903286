use std::path::Path;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;
use crate::cache::SqliteCache;

/// Opens the cache at `path`.
///
/// # Errors
///
/// Returns an error if the file doesn't exist and `create_if_missing` is false,
/// or if SQLite refuses to open it.
pub fn open_cache(path: &Path, opts: &AdminOpenOptions) -> Result<SqliteCache> {
    if !path.exists() && !opts.create_if_missing {
        return Err(AdminError::missing_cache(path));
    }
    Ok(SqliteCache::open(path, opts.cache.clone())?)
}
