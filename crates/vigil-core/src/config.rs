//! Configuration loading and typed config structures for Vigil.
//!
//! The canonical configuration lives in `vigil-config.yaml` at the project
//! root. Each section mirrors the runtime policy of one component and is
//! deserialized straight into it, so a missing key falls back to the
//! component's documented default.

use std::path::Path;

use serde::Deserialize;
use vigil_resilience::{RateLimitPolicy, RetryPolicy};

use crate::coordinator::LockPolicy;
use crate::evolution::EvolutionPolicy;
use crate::ledger::DedupPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VigilConfig {
    /// Connection strings and the operator port.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Retry policy for feed, engine, and store calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Sliding-window limiter for outbound calls.
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,

    /// Dedup ledger initialization.
    #[serde(default)]
    pub dedup: DedupPolicy,

    /// Manual-session lock.
    #[serde(default)]
    pub lock: LockPolicy,

    /// Autonomous loop scheduling and recovery.
    #[serde(default)]
    pub evolution: EvolutionPolicy,
}

impl VigilConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values for infrastructure URLs:
    /// - `DATABASE_URL` overrides `infrastructure.postgres_url`
    /// - `DRAGONFLY_URL` overrides `infrastructure.dragonfly_url`
    /// - `ENGINE_URL` overrides `infrastructure.engine_url`
    /// - `FEED_URL` overrides `infrastructure.feed_url`
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load from `path` if it exists, defaults (plus env overrides) otherwise.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let mut config = Self::default();
            config.infrastructure.apply_env_overrides();
            Ok(config)
        }
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // serde_yml reads an empty document as unit, not an empty mapping.
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.infrastructure.apply_env_overrides();
        Ok(config)
    }
}

/// Infrastructure connection strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfrastructureConfig {
    /// PostgreSQL connection URL. Empty keeps everything in memory.
    #[serde(default)]
    pub postgres_url: String,

    /// Dragonfly (Redis-compatible) URL for the lock record. Empty falls
    /// back to PostgreSQL.
    #[serde(default)]
    pub dragonfly_url: String,

    /// Base URL of the analysis engine.
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Base URL of the game feed.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Port of the operator HTTP API.
    #[serde(default = "default_observer_port")]
    pub observer_port: u16,
}

impl InfrastructureConfig {
    /// Override infrastructure URLs with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.postgres_url = val;
        }
        if let Ok(val) = std::env::var("DRAGONFLY_URL") {
            self.dragonfly_url = val;
        }
        if let Ok(val) = std::env::var("ENGINE_URL") {
            self.engine_url = val;
        }
        if let Ok(val) = std::env::var("FEED_URL") {
            self.feed_url = val;
        }
    }
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            postgres_url: String::new(),
            dragonfly_url: String::new(),
            engine_url: default_engine_url(),
            feed_url: default_feed_url(),
            observer_port: default_observer_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_engine_url() -> String {
    "http://localhost:8600".to_owned()
}

fn default_feed_url() -> String {
    "http://localhost:8700".to_owned()
}

const fn default_observer_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_owned()
}
