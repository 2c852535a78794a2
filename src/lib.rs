//! CDO Repo - versioned object repository with delta commits
//!
//! Objects are stored as immutable revisions. Clients read them through
//! views, edit them in transactions that record [`delta`]s, and commit those
//! deltas to the [`server`] repository, which stores new revisions, detects
//! conflicts and invalidates what other sessions have cached.
//!
//! The [`protocol`] module carries requests between a [`client`] session and
//! the repository, either in-process or over the TCP transport in [`net`].
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Versioning engine
pub mod delta;
pub mod revision;
pub mod storage;

// Sessions, protocol and transport
pub mod client;
pub mod net;
pub mod protocol;
pub mod server;

pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, Result, Value};
pub use client::{ClientSession, ClientView, Transaction};
pub use revision::Revision;
pub use server::Repository;

use crate::core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing and the metrics registry.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    installed.map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    system::metrics::init_registry();
    Ok(())
}
