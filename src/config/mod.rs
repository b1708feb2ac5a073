//! Configuration management for docucache
//!
//! Handles loading, validation, profiles and environment overrides. Everything
//! here is read-only to the search core once a `Config` has been built.

use crate::error::{DocCacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub analytics: AnalyticsConfig,
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Backing store selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "memory"
    pub backend: String,
    pub data_dir: PathBuf,
    pub db_file: String,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    /// Whether the memory backend exposes its vector index engine
    #[serde(default = "default_true")]
    pub memory_vector_index: bool,
}

/// Embedding collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "fastembed" or "hash"
    pub provider: String,
    pub model: String,
    /// Fixed vector dimensionality D for this deployment
    pub dimension: usize,
    pub batch_size: usize,
    pub max_text_length: usize,
    /// Process-local embedding cache entries (0 disables)
    #[serde(default)]
    pub cache_capacity: usize,
}

/// Vector index declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    /// Key namespace for vector records
    pub prefix: String,
    /// Pinned index-engine query API version
    pub api_version: u32,
}

/// Search defaults and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub similarity_threshold: f32,
    /// Permissive floor applied to candidates before filters and threshold
    pub candidate_floor: f32,
    pub overscan_factor: usize,
    pub scan_batch_size: usize,
    pub content_max_chars: usize,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Payloads at least this large are zstd-compressed
    pub compress_threshold: usize,
    #[serde(default = "default_true")]
    pub invalidate_on_write: bool,
}

/// Search analytics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub latency_window: usize,
    pub recent_window: usize,
    pub popular_limit: usize,
    pub channel_capacity: usize,
}

/// Deadlines for calls leaving the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub store_ms: u64,
    pub embedding_ms: u64,
}

impl TimeoutConfig {
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    pub fn embedding(&self) -> Duration {
        Duration::from_millis(self.embedding_ms)
    }
}

fn default_true() -> bool {
    true
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_enabled: Option<bool>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DocCacheError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| DocCacheError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| DocCacheError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| DocCacheError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(backend) = overrides.storage_backend {
            self.storage.backend = backend;
        }
        if let Some(provider) = overrides.embedding_provider {
            self.embedding.provider = provider;
        }
        if let Some(model) = overrides.embedding_model {
            self.embedding.model = model;
        }
        if let Some(threshold) = overrides.similarity_threshold {
            self.search.similarity_threshold = threshold;
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = enabled;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: DOCUCACHE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("DOCUCACHE_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__BACKEND" => self.storage.backend = value.to_string(),
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "EMBEDDING__PROVIDER" => self.embedding.provider = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__DIMENSION" => self.embedding.dimension = parse_env(path, value)?,
            "SEARCH__SIMILARITY_THRESHOLD" => {
                self.search.similarity_threshold = parse_env(path, value)?
            }
            "CACHE__ENABLED" => self.cache.enabled = parse_env(path, value)?,
            "CACHE__TTL_SECS" => self.cache.ttl_secs = parse_env(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Path of the SQLite database file, with a leading `~/` expanded
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.storage.data_dir).join(&self.storage.db_file)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            DocCacheError::Config("Cannot determine config directory".to_string())
        })?;

        Ok(config_dir.join("docucache").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| DocCacheError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".docucache"))
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.to_str().and_then(|p| p.strip_prefix("~/")) {
        Some(stripped) => match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| DocCacheError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                backend: "sqlite".to_string(),
                data_dir: PathBuf::from("~/.docucache"),
                db_file: "docucache.sqlite".to_string(),
                pool_size: 16,
                busy_timeout_ms: 5000,
                memory_vector_index: true,
            },
            embedding: EmbeddingConfig {
                provider: "fastembed".to_string(),
                model: "all-MiniLM-L6-v2".to_string(),
                dimension: 384,
                batch_size: 32,
                max_text_length: 8192,
                cache_capacity: 1024,
            },
            index: IndexConfig {
                name: "doc_vectors".to_string(),
                prefix: "vector:".to_string(),
                api_version: 1,
            },
            search: SearchConfig {
                default_limit: 20,
                max_limit: 50,
                similarity_threshold: 0.7,
                candidate_floor: 0.0,
                overscan_factor: 4,
                scan_batch_size: 256,
                content_max_chars: 1000,
            },
            cache: CacheConfig {
                enabled: true,
                ttl_secs: 1800,
                compress_threshold: 4096,
                invalidate_on_write: true,
            },
            analytics: AnalyticsConfig {
                enabled: true,
                latency_window: 1000,
                recent_window: 100,
                popular_limit: 10,
                channel_capacity: 1024,
            },
            timeouts: TimeoutConfig {
                store_ms: 5000,
                embedding_ms: 30_000,
            },
            profiles: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.storage.backend = "memory".to_string();
        config.embedding.dimension = 8;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.storage.backend, "memory");
        assert_eq!(loaded.embedding.dimension, 8);
        assert_eq!(loaded.index.prefix, "vector:");
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = Config::load(&temp.path().join("absent.toml"));
        assert!(matches!(result, Err(DocCacheError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_apply_profile() {
        let mut config = Config::default();
        config.profiles.insert(
            "demo".to_string(),
            ProfileOverrides {
                storage_backend: Some("memory".to_string()),
                embedding_provider: Some("hash".to_string()),
                similarity_threshold: Some(0.2),
                ..Default::default()
            },
        );

        config.apply_profile("demo").unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.search.similarity_threshold, 0.2);
        assert!(config.apply_profile("missing").is_err());
    }

    #[test]
    fn test_db_path_expands_home() {
        let mut config = Config::default();
        config.storage.data_dir = PathBuf::from("/var/lib/docucache");
        assert_eq!(
            config.db_path(),
            PathBuf::from("/var/lib/docucache/docucache.sqlite")
        );

        config.storage.data_dir = PathBuf::from("~/.docucache");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.db_path(), home.join(".docucache/docucache.sqlite"));
        }
    }

    #[test]
    fn test_env_value_parsing() {
        let mut config = Config::default();
        config.set_value_from_env("EMBEDDING__DIMENSION", "1536").unwrap();
        assert_eq!(config.embedding.dimension, 1536);
        assert!(config
            .set_value_from_env("CACHE__ENABLED", "sometimes")
            .is_err());
    }
}
