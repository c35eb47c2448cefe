//! Logging setup using `tracing-subscriber`.
//!
//! The filter is taken from the explicit level if one is given, otherwise from
//! the `TSUMIKI_LOG` environment variable (any `EnvFilter` directive), and
//! falls back to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

pub const ENV_LOG: &str = "TSUMIKI_LOG";

/// Installs a global formatting subscriber writing to stderr.
///
/// Fails if a global subscriber was already installed.
pub fn init_logging(level: Option<tracing::Level>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Couldn't install the logging subscriber: {e}"))
}
