//! Configuration management for the repository server
//!
//! Settings come from defaults, an optional TOML file and `CDO_*` environment
//! variables, in that order of precedence (last wins).

use crate::core::error::{Error, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "cdo.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport server configuration
    pub server: ServerConfig,

    /// Repository and store configuration
    pub repository: RepositoryConfig,

    /// Session and transaction configuration
    pub session: SessionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Transport server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Number of request worker threads (0 = auto-detect)
    pub worker_threads: usize,

    /// Maximum frame size accepted from a peer
    pub max_frame_size: usize,

    /// Per-request timeout on the server side
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
}

/// Repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository name reported to clients
    pub name: String,

    /// List chunk size used when a client does not ask for one (-1 = unchunked)
    pub default_list_chunk: i32,

    /// Number of prepared statements kept for reuse
    pub statement_cache_capacity: usize,
}

/// Session and transaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a client waits for a commit acknowledgement
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub commit_timeout: Duration,

    /// How long a client waits for any other response
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,

    /// Whether newly opened client views deliver invalidation notifications
    pub invalidation_notifications: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2036)),
            max_connections: 1_000,
            worker_threads: 0,
            max_frame_size: 16 * 1024 * 1024, // 16MB
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "repo1".to_string(),
            default_list_chunk: -1,
            statement_cache_capacity: 64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_millis(100_000),
            request_timeout: Duration::from_secs(30),
            invalidation_notifications: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("CDO_BIND_ADDR") {
            self.server.bind_addr = addr
                .parse()
                .map_err(|e| Error::config(format!("Invalid bind address: {}", e)))?;
        }

        if let Some(workers) = lookup("CDO_WORKER_THREADS") {
            self.server.worker_threads = workers
                .parse()
                .map_err(|e| Error::config(format!("Invalid worker threads: {}", e)))?;
        }

        if let Some(name) = lookup("CDO_REPOSITORY_NAME") {
            self.repository.name = name;
        }

        if let Some(chunk) = lookup("CDO_LIST_CHUNK") {
            self.repository.default_list_chunk = chunk
                .parse()
                .map_err(|e| Error::config(format!("Invalid list chunk: {}", e)))?;
        }

        if let Some(timeout) = lookup("CDO_COMMIT_TIMEOUT") {
            self.session.commit_timeout = parse_duration(&timeout).map_err(Error::config)?;
        }

        if let Some(level) = lookup("CDO_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("CDO_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.repository.name.trim().is_empty() {
            return Err(Error::config("Repository name must not be empty"));
        }

        if self.repository.default_list_chunk == 0 || self.repository.default_list_chunk < -1 {
            return Err(Error::config("List chunk must be positive or -1 (unchunked)"));
        }

        if self.server.worker_threads > 1024 {
            return Err(Error::config("Too many worker threads (maximum 1024)"));
        }

        if self.server.max_frame_size < 1024 {
            return Err(Error::config("Max frame size too small (minimum 1KB)"));
        }

        if self.session.commit_timeout.is_zero() {
            return Err(Error::config("Commit timeout must be positive"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "json" | "pretty" | "compact" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }

    /// Get optimal number of worker threads
    pub fn optimal_worker_threads(&self) -> usize {
        if self.server.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.server.worker_threads
        }
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

// Custom deserializer for Duration from string
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '5m', or seconds as an integer")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(value))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

// Simple duration parser for common formats
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.session.commit_timeout, Duration::from_secs(100));
        assert_eq!(config.repository.default_list_chunk, -1);
    }

    #[test]
    fn parses_partial_toml_with_durations() {
        let config = Config::from_toml(
            r#"
            [repository]
            name = "models"
            default_list_chunk = 100

            [session]
            commit_timeout = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.repository.name, "models");
        assert_eq!(config.repository.default_list_chunk, 100);
        assert_eq!(config.session.commit_timeout, Duration::from_millis(250));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nworker_threads = 4\nrequest_timeout = 5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.optimal_worker_threads(), 4);
        assert_eq!(config.server.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn overrides_apply_and_validate() {
        let vars: HashMap<&str, &str> = [
            ("CDO_COMMIT_TIMEOUT", "2s"),
            ("CDO_LIST_CHUNK", "10"),
            ("CDO_LOG_LEVEL", "loud"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session.commit_timeout, Duration::from_secs(2));
        assert_eq!(config.repository.default_list_chunk, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("soon").is_err());
    }
}
