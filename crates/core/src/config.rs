//! k-NN configuration via `knn.toml`
//!
//! Same model as the database config: a commented default file is written on
//! first use, and every field falls back to its default when omitted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{KnnError, KnnResult};

/// Config file name placed in the index data directory.
pub const CONFIG_FILE_NAME: &str = "knn.toml";

/// Handle cache eviction settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Bound the total native size of loaded handles
    #[serde(default)]
    pub weight_circuit_breaker: bool,
    /// Byte budget used when the weight circuit breaker is on
    #[serde(default = "default_max_weight_bytes")]
    pub max_weight_bytes: u64,
    /// Evict handles that have not been used for `idle_timeout_ms`
    #[serde(default = "default_true")]
    pub idle_eviction: bool,
    /// Idle duration before a handle is evicted
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// How often the background sweeper runs an eviction pass
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Maximum number of queued release tasks
    #[serde(default = "default_release_queue_depth")]
    pub release_queue_depth: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_weight_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_idle_timeout_ms() -> u64 {
    90 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 1000
}

fn default_release_queue_depth() -> usize {
    4096
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            weight_circuit_breaker: false,
            max_weight_bytes: default_max_weight_bytes(),
            idle_eviction: true,
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            release_queue_depth: default_release_queue_depth(),
        }
    }
}

impl CacheConfig {
    /// Config with both eviction policies disabled
    pub fn unbounded() -> Self {
        Self {
            weight_circuit_breaker: false,
            idle_eviction: false,
            ..Self::default()
        }
    }

    /// Enable weight-based eviction with the given budget
    pub fn with_weight_budget(mut self, bytes: u64) -> Self {
        self.weight_circuit_breaker = true;
        self.max_weight_bytes = bytes;
        self
    }

    /// Enable time-based eviction with the given idle duration
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_eviction = true;
        self.idle_timeout_ms = idle.as_millis() as u64;
        self
    }

    /// Effective weight budget, if weight eviction is enabled
    pub fn weight_budget(&self) -> Option<u64> {
        self.weight_circuit_breaker.then_some(self.max_weight_bytes)
    }

    /// Effective idle timeout, if time eviction is enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_eviction
            .then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Sweep interval for the background sweeper
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Polling granularity of the file lifecycle watcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchFrequency {
    /// Every 5 seconds
    #[default]
    High,
    /// Every 30 seconds
    Medium,
    /// Every 60 seconds
    Low,
}

impl WatchFrequency {
    /// Polling interval for this frequency
    pub fn interval(self) -> Duration {
        match self {
            WatchFrequency::High => Duration::from_secs(5),
            WatchFrequency::Medium => Duration::from_secs(30),
            WatchFrequency::Low => Duration::from_secs(60),
        }
    }
}

/// File lifecycle watcher settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
    /// Watch sidecar files for deletion
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Polling frequency
    #[serde(default)]
    pub frequency: WatchFrequency,
    /// Explicit polling interval, overriding `frequency`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: WatchFrequency::High,
            interval_ms: None,
        }
    }
}

impl WatcherConfig {
    /// Effective polling interval
    pub fn poll_interval(&self) -> Duration {
        self.interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.frequency.interval())
    }
}

/// Sidecar writer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriterConfig {
    /// Number of build worker threads
    #[serde(default = "default_build_threads")]
    pub build_threads: usize,
    /// Maximum number of queued builds
    #[serde(default = "default_build_queue_depth")]
    pub build_queue_depth: usize,
    /// Fail a segment write whose build runs longer than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_timeout_ms: Option<u64>,
}

fn default_build_threads() -> usize {
    1
}

fn default_build_queue_depth() -> usize {
    64
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            build_threads: default_build_threads(),
            build_queue_depth: default_build_queue_depth(),
            build_timeout_ms: None,
        }
    }
}

impl WriterConfig {
    /// Effective build timeout
    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_ms.map(Duration::from_millis)
    }
}

/// Query execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryConfig {
    /// Largest accepted `k`
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    /// Cache lookups retried after observing an invalidated handle
    #[serde(default = "default_eviction_retries")]
    pub eviction_retries: usize,
}

fn default_max_k() -> usize {
    10_000
}

fn default_eviction_retries() -> usize {
    1
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_k: default_max_k(),
            eviction_retries: default_eviction_retries(),
        }
    }
}

/// k-NN configuration loaded from `knn.toml`.
///
/// # Example
///
/// ```toml
/// [cache]
/// weight_circuit_breaker = true
/// max_weight_bytes = 536870912
/// idle_timeout_ms = 600000
///
/// [watcher]
/// frequency = "high"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KnnConfig {
    /// Handle cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// File lifecycle watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Sidecar writer settings
    #[serde(default)]
    pub writer: WriterConfig,
    /// Query settings
    #[serde(default)]
    pub query: QueryConfig,
}

impl KnnConfig {
    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> KnnResult<()> {
        if self.cache.weight_circuit_breaker && self.cache.max_weight_bytes == 0 {
            return Err(KnnError::InvalidConfig(
                "cache.max_weight_bytes must be > 0 when weight_circuit_breaker is on".into(),
            ));
        }
        if self.cache.idle_eviction && self.cache.sweep_interval_ms == 0 {
            return Err(KnnError::InvalidConfig(
                "cache.sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.cache.release_queue_depth == 0 {
            return Err(KnnError::InvalidConfig(
                "cache.release_queue_depth must be > 0".into(),
            ));
        }
        if self.writer.build_threads == 0 {
            return Err(KnnError::InvalidConfig(
                "writer.build_threads must be > 0".into(),
            ));
        }
        if self.writer.build_queue_depth == 0 {
            return Err(KnnError::InvalidConfig(
                "writer.build_queue_depth must be > 0".into(),
            ));
        }
        if self.query.max_k == 0 {
            return Err(KnnError::InvalidConfig("query.max_k must be > 0".into()));
        }
        if self.watcher.interval_ms == Some(0) {
            return Err(KnnError::InvalidConfig(
                "watcher.interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Strata k-NN configuration

[cache]
# Bound the total native size of loaded indexes (default: false)
weight_circuit_breaker = false
# Budget in bytes when the circuit breaker is on (default: 1 GiB)
max_weight_bytes = 1073741824
# Evict indexes that are not queried for idle_timeout_ms (default: true)
idle_eviction = true
# 90 minutes
idle_timeout_ms = 5400000
# How often idle indexes are swept
sweep_interval_ms = 60000
release_queue_depth = 4096

[watcher]
# Invalidate cached indexes when their segment files are deleted
enabled = true
# "high" (5s), "medium" (30s) or "low" (60s)
frequency = "high"
# interval_ms = 1000

[writer]
build_threads = 1
build_queue_depth = 64
# build_timeout_ms = 600000

[query]
max_k = 10000
eviction_retries = 1
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> KnnResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KnnError::Io(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: KnnConfig = toml::from_str(&content).map_err(|e| {
            KnnError::InvalidConfig(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> KnnResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                KnnError::Io(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> KnnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| KnnError::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            KnnError::Io(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = KnnConfig::default();
        assert!(!config.cache.weight_circuit_breaker);
        assert_eq!(config.cache.weight_budget(), None);
        assert_eq!(
            config.cache.idle_timeout(),
            Some(Duration::from_secs(90 * 60))
        );
        assert_eq!(config.watcher.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.query.eviction_retries, 1);
    }

    #[test]
    fn default_toml_parses_to_default() {
        let config: KnnConfig = toml::from_str(KnnConfig::default_toml()).unwrap();
        assert_eq!(config, KnnConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();
        let config = KnnConfig::from_file(&path).unwrap();
        assert_eq!(config, KnnConfig::default());
    }

    #[test]
    fn parse_frequency_and_override() {
        let config: KnnConfig = toml::from_str(
            r#"
[watcher]
frequency = "low"
"#,
        )
        .unwrap();
        assert_eq!(config.watcher.frequency, WatchFrequency::Low);
        assert_eq!(config.watcher.poll_interval(), Duration::from_secs(60));

        let config: KnnConfig = toml::from_str(
            r#"
[watcher]
frequency = "medium"
interval_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_frequency_is_rejected() {
        let parsed: Result<KnnConfig, _> = toml::from_str("[watcher]\nfrequency = \"turbo\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn zero_build_threads_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[writer]\nbuild_threads = 0\n").unwrap();
        let err = KnnConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, KnnError::InvalidConfig(_)));
    }

    #[test]
    fn zero_budget_only_matters_when_breaker_enabled() {
        let mut config = KnnConfig::default();
        config.cache.max_weight_bytes = 0;
        assert!(config.validate().is_ok());
        config.cache.weight_circuit_breaker = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[query]\nmax_k = 50\n").unwrap();

        KnnConfig::write_default_if_missing(&path).unwrap();

        let config = KnnConfig::from_file(&path).unwrap();
        assert_eq!(config.query.max_k, 50);
    }

    #[test]
    fn write_to_file_preserves_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = KnnConfig {
            cache: CacheConfig::unbounded().with_weight_budget(4096),
            writer: WriterConfig {
                build_threads: 4,
                build_queue_depth: 8,
                build_timeout_ms: Some(30_000),
            },
            ..KnnConfig::default()
        };
        config.write_to_file(&path).unwrap();

        let loaded = KnnConfig::from_file(&path).unwrap();
        assert_eq!(loaded.cache.weight_budget(), Some(4096));
        assert_eq!(loaded.cache.idle_timeout(), None);
        assert_eq!(loaded.writer.build_timeout(), Some(Duration::from_secs(30)));
    }
}
