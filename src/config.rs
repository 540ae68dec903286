//! Configuration file.
//!
//! ```toml
//! [cache]
//! path = "/var/lib/objects/cache.db"
//! busy_timeout_ms = 5000
//!
//! [pipeline]
//! workers = 4
//! upload_batch_items = 500
//! compress = true
//!
//! [logging]
//! level = "sombra_transport=debug,info"
//! ```
//!
//! Every key is optional; absent keys keep the library defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{default_cache_path, CacheOptions};
use crate::error::TransportError;
use crate::logging::DEFAULT_LOG_LEVEL;
use crate::pipeline::PipelineOptions;
use crate::serialization::DeserializeOptions;

/// Failure to load the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for this layout.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl From<ConfigError> for TransportError {
    fn from(err: ConfigError) -> Self {
        TransportError::Config(err.to_string())
    }
}

/// `<config dir>/sombra-transport/config.toml`, when the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sombra-transport").join("config.toml"))
}

/// `[cache]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Database file; defaults to the platform data directory.
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u64>,
    /// Read connections kept open.
    pub max_readers: Option<usize>,
}

/// `[pipeline]` table. Every key overrides the matching [`PipelineOptions`] field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    /// Worker threads.
    pub workers: Option<usize>,
    /// Inter-stage queue capacity.
    pub queue_capacity: Option<usize>,
    /// Ids per cache presence lookup.
    pub cache_chunk: Option<usize>,
    /// Records per upload request.
    pub upload_batch_items: Option<usize>,
    /// Bytes per upload request.
    pub upload_batch_bytes: Option<usize>,
    /// Ids per download request.
    pub download_batch: Option<usize>,
    /// Download requests in flight.
    pub download_concurrency: Option<usize>,
    /// Gzip upload bodies.
    pub compress: Option<bool>,
    /// Treat every record as new on send.
    pub skip_cache_read: Option<bool>,
    /// Skip unresolvable references on receive.
    pub skip_invalid: Option<bool>,
}

/// `[logging]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// `tracing` filter directive, such as `debug`.
    pub level: Option<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Local cache settings.
    #[serde(default)]
    pub cache: CacheSection,
    /// Pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl TransportConfig {
    /// Loads `explicit`, or the default path when it exists. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::read(&path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Reads and validates `path`.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pipeline.workers", self.pipeline.workers),
            ("pipeline.queue_capacity", self.pipeline.queue_capacity),
            ("pipeline.cache_chunk", self.pipeline.cache_chunk),
            ("pipeline.upload_batch_items", self.pipeline.upload_batch_items),
            ("pipeline.upload_batch_bytes", self.pipeline.upload_batch_bytes),
            ("pipeline.download_batch", self.pipeline.download_batch),
            ("pipeline.download_concurrency", self.pipeline.download_concurrency),
            ("cache.max_readers", self.cache.max_readers),
        ];
        for (key, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// Configured cache location, falling back to the platform default.
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache.path.clone().or_else(default_cache_path)
    }

    /// Cache connection settings from the `[cache]` table.
    pub fn cache_options(&self) -> CacheOptions {
        let mut options = CacheOptions::default();
        if let Some(ms) = self.cache.busy_timeout_ms {
            options = options.busy_timeout(Duration::from_millis(ms));
        }
        if let Some(readers) = self.cache.max_readers {
            options = options.max_readers(readers);
        }
        options
    }

    /// Library defaults overridden by the `[pipeline]` section.
    pub fn pipeline_options(&self) -> PipelineOptions {
        let section = &self.pipeline;
        let mut options = PipelineOptions::new();
        if let Some(workers) = section.workers {
            options = options.workers(workers);
        }
        if let Some(capacity) = section.queue_capacity {
            options = options.queue_capacity(capacity);
        }
        if let Some(chunk) = section.cache_chunk {
            options = options.cache_chunk(chunk);
        }
        let items = section.upload_batch_items.unwrap_or(options.upload_batch_items);
        let bytes = section.upload_batch_bytes.unwrap_or(options.upload_batch_bytes);
        options = options.upload_batch(items, bytes);
        if let Some(batch) = section.download_batch {
            options = options.download_batch(batch);
        }
        if let Some(requests) = section.download_concurrency {
            options = options.download_concurrency(requests);
        }
        if let Some(compress) = section.compress {
            options = options.compress(compress);
        }
        if let Some(skip) = section.skip_cache_read {
            options = options.skip_cache_read(skip);
        }
        if let Some(skip) = section.skip_invalid {
            options = options.deserialize(DeserializeOptions::new().skip_invalid(skip));
        }
        options
    }

    /// Configured log filter, or [`DEFAULT_LOG_LEVEL`].
    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}
