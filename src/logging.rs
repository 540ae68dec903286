//! `tracing` subscriber setup.

use crate::error::{Result, TransportError};
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when neither the config file nor the caller names one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global `tracing` subscriber.
///
/// `level` is an `EnvFilter` directive such as `"debug"` or
/// `"sombra_transport::pipeline=trace,info"`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| TransportError::Config(format!("Invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| TransportError::Config("Logging already initialized".into()))
}
