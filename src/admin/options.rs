use crate::cache::CacheOptions;

/// Common options used when opening a cache for administrative commands.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Connection settings for the SQLite cache.
    pub cache: CacheOptions,
    /// Whether to create the cache if it doesn't exist.
    pub create_if_missing: bool,
}

impl AdminOpenOptions {
    /// Sets [`AdminOpenOptions::create_if_missing`].
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}
