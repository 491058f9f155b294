// Engine configuration
// Loaded from ~/.config/gridrelay/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// What admission does when a bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Wait for refill, up to `max_wait_ms` (default)
    #[default]
    Blocking,
    /// Fail RATE_LIMIT_EXCEEDED immediately
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window_ms: u64,
}

impl BucketConfig {
    pub const fn new(capacity: u32, window_ms: u64) -> Self {
        Self { capacity, window_ms }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::new(60, 60_000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Per-user read quota of the remote API
    pub read: BucketConfig,
    /// Writes are stricter
    pub write: BucketConfig,
    pub policy: QuotaPolicy,
    /// Longest a blocking acquire will wait before failing
    pub max_wait_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            read: BucketConfig::new(300, 60_000),
            write: BucketConfig::new(60, 60_000),
            policy: QuotaPolicy::Blocking,
            max_wait_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            max_entries: 512,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub timeout_ms: u64,
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub batch_limit_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            batch_limit_bytes: 9_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Idle OPEN transactions abort after this long
    pub idle_ttl_ms: u64,
    /// Terminal transactions stay queryable this long
    pub retention_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_ms: 5 * 60_000,
            retention_ms: 15 * 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Entries kept per spreadsheet
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_base: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { api_base: "https://sheets.googleapis.com/v4".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub quota: QuotaConfig,
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    pub transactions: TransactionConfig,
    pub history: HistoryConfig,
    pub remote: RemoteConfig,
}

impl EngineConfig {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gridrelay")
            .join("config.toml")
    }

    /// Load from the default path, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(input: &str) -> Result<Self, String> {
        let config: EngineConfig = toml::from_str(input).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let buckets = [("quota.read", &self.quota.read), ("quota.write", &self.quota.write)];
        for (name, bucket) in buckets {
            if bucket.capacity == 0 || bucket.window_ms == 0 {
                return Err(format!("{}: capacity and window_ms must be positive", name));
            }
        }
        if self.dispatch.max_attempts == 0 {
            return Err("dispatch.max_attempts must be at least 1".into());
        }
        if self.dispatch.timeout_ms == 0 {
            return Err("dispatch.timeout_ms must be positive".into());
        }
        if self.dispatch.batch_limit_bytes == 0 {
            return Err("dispatch.batch_limit_bytes must be positive".into());
        }
        if self.cache.max_entries == 0 {
            return Err("cache.max_entries must be at least 1".into());
        }
        if self.history.capacity == 0 {
            return Err("history.capacity must be at least 1".into());
        }
        Ok(())
    }

    /// Save to the default path
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, text).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.quota.read, BucketConfig::new(300, 60_000));
        assert_eq!(config.quota.write, BucketConfig::new(60, 60_000));
        assert_eq!(config.quota.policy, QuotaPolicy::Blocking);
        assert_eq!(config.dispatch.batch_limit_bytes, 9_000_000);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.history.capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
[quota]
policy = "fail_fast"

[quota.write]
capacity = 10

[cache]
ttl_ms = 5000
"#,
        )
        .unwrap();
        assert_eq!(config.quota.policy, QuotaPolicy::FailFast);
        assert_eq!(config.quota.write.capacity, 10);
        assert_eq!(config.quota.write.window_ms, 60_000);
        assert_eq!(config.quota.read.capacity, 300);
        assert_eq!(config.cache.ttl_ms, 5000);
        assert_eq!(config.cache.max_entries, 512);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml("[dispatch]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.contains("max_attempts"));

        let err = EngineConfig::from_toml("[quota.read]\nwindow_ms = 0\n").unwrap_err();
        assert!(err.contains("quota.read"));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(EngineConfig::from_toml("[quota]\npolicy = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = EngineConfig::default();
        config.transactions.idle_ttl_ms = 1234;
        config.remote.api_base = "http://localhost:9999".into();
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_path_under_gridrelay() {
        let path = EngineConfig::config_path();
        assert!(path.ends_with("gridrelay/config.toml"));
    }
}
