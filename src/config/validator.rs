use crate::config::Config;
use crate::error::{DocCacheError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_index(config, &mut errors);
        Self::validate_search(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_analytics(config, &mut errors);
        Self::validate_timeouts(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DocCacheError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        let backend = &config.storage.backend;
        if backend != "sqlite" && backend != "memory" {
            errors.push(ValidationError::new(
                "storage.backend",
                format!("Backend must be 'sqlite' or 'memory', got '{}'", backend),
            ));
        }

        if backend == "sqlite" {
            if config.storage.db_file.is_empty() {
                errors.push(ValidationError::new(
                    "storage.db_file",
                    "Database file name cannot be empty",
                ));
            }
            if config.storage.pool_size == 0 {
                errors.push(ValidationError::new(
                    "storage.pool_size",
                    "Pool size must be greater than 0",
                ));
            }
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let provider = &config.embedding.provider;
        if provider != "fastembed" && provider != "hash" {
            errors.push(ValidationError::new(
                "embedding.provider",
                format!("Provider must be 'fastembed' or 'hash', got '{}'", provider),
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Vector dimension must be greater than 0",
            ));
        }

        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if config.embedding.max_text_length == 0 {
            errors.push(ValidationError::new(
                "embedding.max_text_length",
                "Maximum text length must be greater than 0",
            ));
        }

        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_index(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.index.name.is_empty() {
            errors.push(ValidationError::new(
                "index.name",
                "Index name cannot be empty",
            ));
        }

        // Records are discovered by prefix; an empty prefix would sweep up
        // cache and analytics keys as well.
        if config.index.prefix.is_empty() {
            errors.push(ValidationError::new(
                "index.prefix",
                "Key prefix cannot be empty",
            ));
        } else if config.index.prefix.starts_with("cache:")
            || config.index.prefix.starts_with("stats:")
        {
            errors.push(ValidationError::new(
                "index.prefix",
                format!("Prefix '{}' collides with a reserved namespace", config.index.prefix),
            ));
        }
    }

    fn validate_search(config: &Config, errors: &mut Vec<ValidationError>) {
        let search = &config.search;

        if search.max_limit == 0 {
            errors.push(ValidationError::new(
                "search.max_limit",
                "Maximum limit must be greater than 0",
            ));
        }

        if search.default_limit == 0 || search.default_limit > search.max_limit {
            errors.push(ValidationError::new(
                "search.default_limit",
                format!(
                    "Default limit must be between 1 and {}, got {}",
                    search.max_limit, search.default_limit
                ),
            ));
        }

        if !(0.0..=1.0).contains(&search.similarity_threshold) {
            errors.push(ValidationError::new(
                "search.similarity_threshold",
                format!(
                    "Threshold must be between 0.0 and 1.0, got {}",
                    search.similarity_threshold
                ),
            ));
        }

        if !(0.0..=1.0).contains(&search.candidate_floor) {
            errors.push(ValidationError::new(
                "search.candidate_floor",
                format!(
                    "Candidate floor must be between 0.0 and 1.0, got {}",
                    search.candidate_floor
                ),
            ));
        }

        if search.overscan_factor == 0 {
            errors.push(ValidationError::new(
                "search.overscan_factor",
                "Overscan factor must be at least 1",
            ));
        }

        if search.scan_batch_size == 0 {
            errors.push(ValidationError::new(
                "search.scan_batch_size",
                "Scan batch size must be greater than 0",
            ));
        }

        if search.content_max_chars == 0 {
            errors.push(ValidationError::new(
                "search.content_max_chars",
                "Content length must be greater than 0",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.enabled && config.cache.ttl_secs == 0 {
            errors.push(ValidationError::new(
                "cache.ttl_secs",
                "TTL must be greater than 0 when the cache is enabled",
            ));
        }
    }

    fn validate_analytics(config: &Config, errors: &mut Vec<ValidationError>) {
        let analytics = &config.analytics;
        if !analytics.enabled {
            return;
        }

        if analytics.latency_window == 0 {
            errors.push(ValidationError::new(
                "analytics.latency_window",
                "Latency window must be greater than 0",
            ));
        }

        if analytics.channel_capacity == 0 {
            errors.push(ValidationError::new(
                "analytics.channel_capacity",
                "Channel capacity must be greater than 0",
            ));
        }
    }

    fn validate_timeouts(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.timeouts.store_ms == 0 {
            errors.push(ValidationError::new(
                "timeouts.store_ms",
                "Store timeout must be greater than 0",
            ));
        }

        if config.timeouts.embedding_ms == 0 {
            errors.push(ValidationError::new(
                "timeouts.embedding_ms",
                "Embedding timeout must be greater than 0",
            ));
        }
    }
}
