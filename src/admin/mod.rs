#![forbid(unsafe_code)]

//! Cache administration utilities.
//!
//! Statistics and integrity verification over a local object cache, used by
//! the `stats` and `verify` CLI commands.

mod error;
mod options;
mod stats;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Configuration options for opening a cache in admin mode.
pub use options::AdminOpenOptions;

/// Record counts, sizes and per-type totals.
pub use stats::{cache_stats, stats, CacheStatsSection, FilesystemStats, StatsReport};

/// Cache integrity verification.
///
/// Re-hashes every record against its key and checks that closures resolve.
pub use verify::{
    verify, verify_cache, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity,
};

/// Opens a cache file for administrative commands.
pub use util::open_cache;
