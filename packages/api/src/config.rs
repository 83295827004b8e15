//! Deployment configuration.
//!
//! Settings come from a TOML file (path given explicitly or through
//! `NEDREX_CONFIG`), with a small set of environment overrides applied on
//! top. Every section has defaults, so an empty file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use actors::{KindDescriptor, KindRegistry, MaintenanceSettings, WorkerPool, WorkerSettings};
use db::DbConfig;
use jobs_core::{CachePolicy, QueueName};
use serde::Deserialize;
use storage::StorageConfig;
use thiserror::Error;

use crate::rate_limit::RateLimitConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "NEDREX_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Worker pools and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pools: Vec<WorkerPool>,
    pub poll_timeout_secs: u64,
    pub cancel_check_secs: u64,
    pub retry_backoff_ms: u64,
    /// Interval of the recovery scan, cache eviction and counter purge.
    pub recovery_interval_secs: u64,
    /// Fail running jobs older than this many seconds.
    pub stale_after_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pools: vec![
                WorkerPool::new(vec![QueueName::default_queue()], 2),
                WorkerPool::new(vec![QueueName::heavy()], 1),
            ],
            poll_timeout_secs: 5,
            cancel_check_secs: 2,
            retry_backoff_ms: 1000,
            recovery_interval_secs: 30,
            stale_after_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs.max(1)),
            cancel_check_interval: Duration::from_secs(self.cancel_check_secs.max(1)),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn maintenance(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            tick_interval: Duration::from_secs(self.recovery_interval_secs.max(1)),
            stale_after: self.stale_after_secs.map(Duration::from_secs),
        }
    }
}

/// Complete configuration of one deployment instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CachePolicy,
    pub workers: WorkerConfig,
    /// Directory holding the analysis scripts of the built-in kinds.
    pub scripts_dir: PathBuf,
    /// Register the NeDRex analyses before any `kinds` entries.
    pub builtin_kinds: bool,
    /// Additional or overriding kind descriptors.
    pub kinds: Vec<KindDescriptor>,
    /// Version of the underlying network data. Mixed into fingerprints so a
    /// data update never serves results computed on the old graph.
    pub data_version: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CachePolicy::default(),
            workers: WorkerConfig::default(),
            scripts_dir: PathBuf::from("./scripts"),
            builtin_kinds: true,
            kinds: Vec::new(),
            data_version: None,
        }
    }
}

impl AppConfig {
    /// Load from `path`, else from `NEDREX_CONFIG`, else defaults. Environment
    /// overrides are applied in every case.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                tracing::info!("Loading config from {}", path.display());
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `NEDREX_INSTANCE` and `NEDREX_DB_ENDPOINT`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(instance) = lookup("NEDREX_INSTANCE").filter(|v| !v.is_empty()) {
            self.db.namespace = instance;
        }
        if let Some(endpoint) = lookup("NEDREX_DB_ENDPOINT").filter(|v| !v.is_empty()) {
            self.db.endpoint = endpoint;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.enabled && self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be positive".into(),
            ));
        }
        if self.db.namespace.is_empty() || self.db.database.is_empty() {
            return Err(ConfigError::Invalid(
                "db.namespace and db.database must be set".into(),
            ));
        }
        for pool in &self.workers.pools {
            if pool.queues.is_empty() {
                return Err(ConfigError::Invalid(
                    "every worker pool needs at least one queue".into(),
                ));
            }
        }
        if let Some(stale) = self.workers.stale_after_secs {
            let registry = self.kind_registry();
            let longest = registry
                .kinds()
                .iter()
                .filter_map(|kind| registry.get(kind))
                .map(|descriptor| descriptor.timeout_secs)
                .max()
                .unwrap_or(0);
            if stale <= longest {
                return Err(ConfigError::Invalid(format!(
                    "workers.stale_after_secs ({stale}) must exceed the longest job timeout ({longest})"
                )));
            }
        }
        Ok(())
    }

    /// Built-in kinds (when enabled) overlaid with the configured ones.
    pub fn kind_registry(&self) -> KindRegistry {
        let mut registry = if self.builtin_kinds {
            KindRegistry::nedrex_defaults(&self.scripts_dir)
        } else {
            KindRegistry::new()
        };
        for descriptor in &self.kinds {
            registry.register(descriptor.clone());
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::rate_limit::WindowStrategy;
    use jobs_core::JobKind;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.db, DbConfig::default());
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.limit, 1000);
        assert_eq!(config.workers.pools.len(), 2);
        assert!(config.kind_registry().contains(&JobKind::from("diamond")));
        config.validate().unwrap();
    }

    #[test]
    fn parses_every_section() {
        let config = AppConfig::from_toml_str(
            r#"
            scripts_dir = "/opt/nedrex/scripts"
            data_version = "2.14"

            [db]
            endpoint = "ws://db:8000"
            namespace = "licensed"

            [storage]
            backend = "memory"

            [rate_limit]
            limit = 50
            window_secs = 3600
            strategy = "sliding"
            fail_open = false

            [cache]
            policy = "max_age"
            max_age_secs = 86400

            [workers]
            stale_after_secs = 200000

            [[workers.pools]]
            queues = ["default", "heavy"]
            concurrency = 4

            [[kinds]]
            kind = "bicon"
            queue = "heavy"
            timeout_secs = 7200
            [kinds.command]
            program = "/usr/bin/bicon"
            args = ["{params}", "{output}"]
            "#,
        )
        .unwrap();

        assert_eq!(config.db.endpoint, "ws://db:8000");
        assert_eq!(config.db.namespace, "licensed");
        assert_eq!(config.db.database, "jobs");
        assert_eq!(config.storage, StorageConfig::memory());
        assert_eq!(config.rate_limit.limit, 50);
        assert_eq!(config.rate_limit.strategy, WindowStrategy::Sliding);
        assert!(!config.rate_limit.fail_open);
        assert_eq!(config.cache, CachePolicy::MaxAge { max_age_secs: 86400 });
        assert_eq!(config.workers.pools.len(), 1);
        assert_eq!(config.workers.pools[0].concurrency, 4);
        assert_eq!(
            config.workers.maintenance().stale_after,
            Some(Duration::from_secs(200000))
        );
        assert_eq!(config.data_version.as_deref(), Some("2.14"));

        let registry = config.kind_registry();
        let bicon = registry.get(&JobKind::from("bicon")).unwrap();
        assert_eq!(bicon.queue, QueueName::heavy());
        assert!(registry.contains(&JobKind::from("must")));
        config.validate().unwrap();
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[rate_limit]\nenabled = false\n").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert!(!config.rate_limit.enabled);

        let missing = AppConfig::load(Some(Path::new("/nonexistent/nedrex.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn environment_selects_the_instance() {
        let env: HashMap<&str, &str> = [
            ("NEDREX_INSTANCE", "open"),
            ("NEDREX_DB_ENDPOINT", "ws://shared-db:8000"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.db.namespace, "open");
        assert_eq!(config.db.endpoint, "ws://shared-db:8000");

        let mut untouched = AppConfig::default();
        untouched.apply_overrides(|_| Some(String::new()));
        assert_eq!(untouched.db, DbConfig::default());
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let zero_window = AppConfig::from_toml_str("[rate_limit]\nwindow_secs = 0").unwrap();
        assert!(matches!(zero_window.validate(), Err(ConfigError::Invalid(_))));

        let short_sweep = AppConfig::from_toml_str("[workers]\nstale_after_secs = 60").unwrap();
        assert!(matches!(short_sweep.validate(), Err(ConfigError::Invalid(_))));

        let no_queues = AppConfig::from_toml_str("[[workers.pools]]\nqueues = []").unwrap();
        assert!(matches!(no_queues.validate(), Err(ConfigError::Invalid(_))));

        assert!(matches!(
            AppConfig::from_toml_str("[rate_limit]\nlimit = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
