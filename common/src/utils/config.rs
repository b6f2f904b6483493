use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Selects the embedding backend for vector generation.
#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    /// Use an OpenAI-compatible API for embeddings (default).
    #[default]
    OpenAI,
    /// Use deterministic hashed embeddings (for testing).
    Hashed,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::S3
}

fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

/// 50 MiB.
fn default_max_file_size_bytes() -> u64 {
    52_428_800
}

fn default_upload_url_ttl_secs() -> u64 {
    900
}

/// Application configuration loaded from the environment and an optional
/// config file. Missing required options abort startup during
/// deserialization.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default)]
    pub object_store_endpoint: Option<String>,
    #[serde(default)]
    pub object_store_access_key: Option<String>,
    #[serde(default)]
    pub object_store_secret: Option<String>,
    #[serde(default)]
    pub object_store_bucket: Option<String>,
    /// 32-byte key, base64.
    pub encryption_key: String,
    pub embeddings_api_key: String,
    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackendKind,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_upload_url_ttl_secs")]
    pub upload_url_ttl_secs: u64,
}

impl AppConfig {
    /// Validates the options that serde alone cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage == StorageKind::S3 {
            for (key, value) in [
                ("object_store_endpoint", &self.object_store_endpoint),
                ("object_store_access_key", &self.object_store_access_key),
                ("object_store_secret", &self.object_store_secret),
                ("object_store_bucket", &self.object_store_bucket),
            ] {
                if value.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::Message(format!(
                        "missing required option {key} for the s3 storage backend"
                    )));
                }
            }
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Message(
                "worker_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Loads the application configuration from the environment and optional config file.
#[allow(clippy::module_name_repetitions)]
pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    Ok(app_config)
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    /// Ready-to-use configuration for tests that never touch S3 or a real
    /// embedding provider.
    pub fn test_config_memory() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/docpipe_test".into(),
            storage: StorageKind::Memory,
            object_store_endpoint: None,
            object_store_access_key: None,
            object_store_secret: None,
            object_store_bucket: None,
            encryption_key: crate::utils::crypto::testing::test_key_base64(),
            embeddings_api_key: "test".into(),
            embeddings_model: default_embeddings_model(),
            embedding_backend: EmbeddingBackendKind::Hashed,
            worker_concurrency: 2,
            max_file_size_bytes: default_max_file_size_bytes(),
            upload_url_ttl_secs: default_upload_url_ttl_secs(),
        }
    }
}
