//! Configuration loaded from YAML
//!
//! Only the options declared here are recognized; unknown keys are rejected so
//! a typo never silently falls back to a default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file
pub const CONFIG_FILE: &str = "config/warden.yaml";
/// Environment variable overriding [`CONFIG_FILE`]
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";
/// Longest accepted scheduler interval, one year
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for [`Config`]
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Values are individually valid but inconsistent
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relational backend the store runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Single-file database, the default
    #[default]
    Sqlite,
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    Mysql,
    /// Non-durable, for tests and throwaway nodes
    Memory,
}

/// Database connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub backend: Backend,
    /// File path for the sqlite backend
    pub path: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: "data/punishments.db".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: "punishments".to_string(),
            username: "warden".to_string(),
            password: String::new(),
            max_connections: 10,
        }
    }
}

impl DatabaseConfig {
    /// Connection URL without credentials, for logs
    #[must_use]
    pub fn connection_url(&self) -> String {
        match self.backend {
            Backend::Sqlite => format!("sqlite://{}", self.path),
            Backend::Postgres => format!(
                "postgres://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            ),
            Backend::Mysql => format!(
                "mysql://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            ),
            Backend::Memory => "memory://".to_string(),
        }
    }
}

/// Punishment cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// TTL for active records and "nothing active" lookups
    pub active_ttl_secs: u64,
    /// TTL for expired and revoked records
    pub terminal_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            active_ttl_secs: 300,
            terminal_ttl_secs: 30,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn active_ttl(&self) -> Duration {
        Duration::from_secs(self.active_ttl_secs)
    }

    #[must_use]
    pub fn terminal_ttl(&self) -> Duration {
        Duration::from_secs(self.terminal_ttl_secs)
    }
}

/// Expiration scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How often the store is re-scanned for due punishments
    pub rescan_interval_secs: u64,
    /// Horizon of expirations preloaded into memory
    pub lookahead_secs: u64,
    /// Longest the timer loop sleeps before re-checking the clock
    pub max_sleep_secs: u64,
    /// Retries of a failed expiry before giving up until the next re-scan
    pub max_retries: u32,
    /// First backoff step; doubles per retry
    pub retry_base_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: 60,
            lookahead_secs: 600,
            max_sleep_secs: 5,
            max_retries: 3,
            retry_base_ms: 250,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    #[must_use]
    pub fn lookahead(&self) -> chrono::TimeDelta {
        i64::try_from(self.lookahead_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    #[must_use]
    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_secs)
    }

    #[must_use]
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

/// Logging output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub directory: String,
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Identity of this node on the sync channel
    pub node_id: String,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `WARDEN_CONFIG` or the default path.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_FILE.to_string());
        Self::load_from(path).await
    }

    /// Load configuration from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_yaml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    ///
    /// # Errors
    /// Returns an error on malformed YAML or unknown keys
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        for (name, secs) in [
            ("rescan_interval_secs", scheduler.rescan_interval_secs),
            ("lookahead_secs", scheduler.lookahead_secs),
            ("max_sleep_secs", scheduler.max_sleep_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::Invalid(format!(
                    "scheduler.{name} must be at most {MAX_INTERVAL_SECS}"
                )));
            }
        }
        if scheduler.max_sleep_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_sleep_secs must be at least 1".to_string(),
            ));
        }
        if scheduler.rescan_interval_secs <= scheduler.max_sleep_secs {
            return Err(ConfigError::Invalid(
                "scheduler.rescan_interval_secs must be longer than scheduler.max_sleep_secs"
                    .to_string(),
            ));
        }
        if scheduler.lookahead_secs <= scheduler.rescan_interval_secs {
            return Err(ConfigError::Invalid(
                "scheduler.lookahead_secs must be longer than scheduler.rescan_interval_secs"
                    .to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.database.backend, Backend::Sqlite);
        assert_eq!(config.database.max_connections, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r"
node_id: proxy-1
database:
  backend: postgresql
  host: db.internal
  port: 5433
  username: warden
  password: hunter2
cache:
  max_entries: 500
scheduler:
  rescan_interval_secs: 30
  lookahead_secs: 120
";
        let config = Config::from_yaml(yaml).expect("Failed to parse");
        assert_eq!(config.node_id, "proxy-1");
        assert_eq!(config.database.backend, Backend::Postgres);
        assert_eq!(config.database.port, 5433);
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.cache.active_ttl_secs, 300);
        assert_eq!(config.scheduler.rescan_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.database.connection_url(),
            "postgres://warden@db.internal:5433/punishments"
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "cache:\n  max_entries: 10\n  eviction: lru\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rescan_must_exceed_max_sleep() {
        let mut config = Config::default();
        config.scheduler.rescan_interval_secs = 5;
        config.scheduler.max_sleep_secs = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_lookahead_must_exceed_rescan() {
        let mut config = Config::default();
        config.scheduler.lookahead_secs = config.scheduler.rescan_interval_secs;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_scheduler_bounds() {
        let mut config = Config::default();
        config.scheduler.lookahead_secs = 10_000_000_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        // Out-of-range values saturate instead of panicking
        assert_eq!(config.scheduler.lookahead(), chrono::TimeDelta::MAX);

        let mut config = Config::default();
        config.scheduler.lookahead_secs = MAX_INTERVAL_SECS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.scheduler.max_sleep_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = Config::load_from(dir.path().join("absent.yaml"))
            .await
            .expect("Missing file should not fail");
        assert_eq!(config.scheduler.lookahead_secs, 600);
    }
}
