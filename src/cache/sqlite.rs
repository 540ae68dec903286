use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};

use super::{CacheError, CacheScan, LocalCache};
use crate::types::ObjectId;

/// Largest number of bound parameters per `IN (...)` lookup.
const MAX_LOOKUP_PARAMS: usize = 500;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS objects (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL
) WITHOUT ROWID";

/// Default cache location: `<data_local_dir>/sombra-transport/cache.db`.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("sombra-transport").join("cache.db"))
}

/// Tuning knobs for [`SqliteCache`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// How long a statement waits on a locked database before giving up.
    pub busy_timeout: Duration,
    /// Reader connections kept open between calls.
    pub max_readers: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            max_readers: 4,
        }
    }
}

impl CacheOptions {
    /// How long a call waits on a locked database.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Read connections kept for reuse.
    pub fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }
}

/// SQLite-backed [`LocalCache`].
///
/// A single writer connection serializes all writes; reads go through a
/// small pool of extra connections so they proceed alongside the writer
/// under WAL.
pub struct SqliteCache {
    path: PathBuf,
    options: CacheOptions,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for SqliteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCache")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl SqliteCache {
    /// Opens or creates the cache at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>, options: CacheOptions) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = open_connection(&path, &options)?;
        writer
            .execute(SCHEMA, [])
            .map_err(|err| classify(err, &options))?;
        info!(path = %path.display(), "opened object cache");
        Ok(Self {
            path,
            options,
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Opens the cache at [`default_cache_path`].
    pub fn open_default() -> Result<Self, CacheError> {
        let path = default_cache_path()
            .ok_or_else(|| CacheError::Unavailable("no local data directory".into()))?;
        Self::open(path, CacheOptions::default())
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the write-ahead log next to the database file.
    pub fn wal_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push("-wal");
        PathBuf::from(name)
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, CacheError> {
        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => open_connection(&self.path, &self.options)?,
        };
        let result = f(&conn).map_err(|err| classify(err, &self.options));
        let mut readers = self.readers.lock();
        if readers.len() < self.options.max_readers {
            readers.push(conn);
        }
        result
    }
}

fn open_connection(path: &Path, options: &CacheOptions) -> Result<Connection, CacheError> {
    let conn = Connection::open(path).map_err(|err| classify(err, options))?;
    conn.busy_timeout(options.busy_timeout)
        .map_err(|err| classify(err, options))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| classify(err, options))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| classify(err, options))?;
    Ok(conn)
}

/// Lock contention that outlived the busy timeout becomes [`CacheError::Busy`].
fn classify(err: rusqlite::Error, options: &CacheOptions) -> CacheError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return CacheError::Busy {
                waited: options.busy_timeout,
            };
        }
    }
    CacheError::Sqlite(err)
}

fn parse_id(raw: String) -> Result<ObjectId, CacheError> {
    ObjectId::parse(&raw).map_err(|err| CacheError::Corrupt(err.to_string()))
}

impl LocalCache for SqliteCache {
    fn has(&self, id: &ObjectId) -> Result<bool, CacheError> {
        self.with_reader(|conn| {
            conn.prepare_cached("SELECT 1 FROM objects WHERE id = ?1")?
                .exists(params![id.as_str()])
        })
    }

    fn has_many(&self, ids: &[ObjectId]) -> Result<HashSet<ObjectId>, CacheError> {
        let mut present = HashSet::new();
        for chunk in ids.chunks(MAX_LOOKUP_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT id FROM objects WHERE id IN ({placeholders})");
            let found: Vec<String> = self.with_reader(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter().map(ObjectId::as_str)), |row| {
                    row.get::<_, String>(0)
                })?;
                rows.collect()
            })?;
            for raw in found {
                present.insert(parse_id(raw)?);
            }
        }
        Ok(present)
    }

    fn get(&self, id: &ObjectId) -> Result<Option<String>, CacheError> {
        self.with_reader(|conn| {
            conn.prepare_cached("SELECT content FROM objects WHERE id = ?1")?
                .query_row(params![id.as_str()], |row| row.get(0))
                .optional()
        })
    }

    fn put(&self, id: &ObjectId, json: &str) -> Result<(), CacheError> {
        let conn = self.writer.lock();
        conn.prepare_cached("INSERT OR IGNORE INTO objects (id, content) VALUES (?1, ?2)")
            .and_then(|mut stmt| stmt.execute(params![id.as_str(), json]))
            .map_err(|err| classify(err, &self.options))?;
        Ok(())
    }

    fn put_batch(&self, items: &[(ObjectId, String)]) -> Result<usize, CacheError> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut conn = self.writer.lock();
        let write = |conn: &mut Connection| -> rusqlite::Result<usize> {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx
                    .prepare_cached("INSERT OR IGNORE INTO objects (id, content) VALUES (?1, ?2)")?;
                for (id, json) in items {
                    inserted += stmt.execute(params![id.as_str(), json])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        };
        let inserted = write(&mut *conn).map_err(|err| classify(err, &self.options))?;
        debug!(batch = items.len(), inserted, "cache batch committed");
        Ok(inserted)
    }

    fn scan_page(
        &self,
        after: Option<&ObjectId>,
        limit: usize,
    ) -> Result<Vec<(ObjectId, String)>, CacheError> {
        let after = after.map(ObjectId::as_str).unwrap_or("");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, String)> = self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, content FROM objects WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after, limit], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        rows.into_iter()
            .map(|(id, json)| Ok((parse_id(id)?, json)))
            .collect()
    }

    fn enumerate(&self) -> CacheScan<'_> {
        CacheScan::new(self)
    }

    fn len(&self) -> Result<u64, CacheError> {
        let count: i64 = self.with_reader(|conn| {
            conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
        })?;
        Ok(count.max(0) as u64)
    }

    fn total_bytes(&self) -> Result<u64, CacheError> {
        let total: i64 = self.with_reader(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(content AS BLOB))), 0) FROM objects",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(total.max(0) as u64)
    }
}
