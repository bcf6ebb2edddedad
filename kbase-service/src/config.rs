//! Service configuration.
//!
//! Settings are read once at startup from an optional `config` file and
//! `KBASE__*` environment variables (see [`loader`]).

mod loader;

pub use loader::load_config;

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the metadata database and blob store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bucket name; blobs live under `{data_dir}/blobs/{bucket}`
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bucket: default_bucket(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("kbase.db")
    }

    pub fn blob_root(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

/// External parse/vectorize service
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Base URL of the processing service. Empty means no client is configured
    /// and new uploads are marked failed instead of processed.
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Size limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Background orchestration settings
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationConfig {
    /// Deadline for one pipeline attempt, independent of any request
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Upper bound on concurrently running pipeline runs
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Extra attempts a run may make after a transient failure (storage I/O,
    /// unreachable or 5xx processing service). Stored on each ledger task when
    /// it is created. Zero disables retries.
    #[serde(default)]
    pub max_retries: u32,

    /// Base delay before a retry; attempt `n` waits `n` times this long
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// How long shutdown waits for in-flight runs to hand their tasks back
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_retries: 0,
            retry_backoff_secs: default_retry_backoff_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl OrchestrationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Delay before retry number `attempt` (starting at 1)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(u64::from(attempt)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Task queue settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
        }
    }
}

// ==================== Default Value Functions ====================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_bucket() -> String {
    "kbase".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_deadline_secs() -> u64 {
    600
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_topic() -> String {
    "document-tasks".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.limits.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.orchestration.deadline(), Duration::from_secs(600));
        assert_eq!(config.orchestration.max_retries, 0);
        assert_eq!(
            config.orchestration.retry_backoff(3),
            Duration::from_secs(15)
        );
        assert_eq!(config.orchestration.max_concurrent_runs, 4);
        assert!(config.processing.base_url.is_empty());
        assert_eq!(config.storage.database_path(), PathBuf::from("./data/kbase.db"));
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "server": { "port": 9000 },
            "processing": { "base_url": "http://localhost:50051" }
        }))
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.processing.base_url, "http://localhost:50051");
        assert_eq!(config.processing.request_timeout_secs, 300);
        assert_eq!(config.queue.topic, "document-tasks");
    }
}
