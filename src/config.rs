//! Engine configuration
//!
//! One `EngineConfig` describes a fetch pipeline: where the relationship
//! service lives, how fast we may talk to it, how long responses stay cached,
//! and the upload/poll and layout timings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error while reading a config file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings for bulk upload submission and job polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum accepted file size in bytes
    pub max_bytes: usize,
    /// Delay between two status requests
    pub poll_interval_ms: u64,
    /// Accepted file extensions (lowercase, without the dot)
    pub allowed_extensions: Vec<String>,
    /// Path the multipart upload is posted to
    pub submit_path: String,
    /// Status path; `{id}` is replaced with the job id
    pub status_path: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024, // 10 MiB
            poll_interval_ms: 2_000,
            allowed_extensions: vec!["csv".to_string(), "txt".to_string()],
            submit_path: "/uploads".to_string(),
            status_path: "/uploads/{id}".to_string(),
        }
    }
}

impl UploadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Status path for a concrete job
    pub fn status_path_for(&self, job_id: &str) -> String {
        self.status_path.replace("{id}", job_id)
    }
}

/// Fetch pipeline and view configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the relationship-management service
    pub base_url: String,
    /// Minimum spacing between two outbound requests
    pub min_interval_ms: u64,
    /// Lifetime of a cached successful response
    pub cache_ttl_secs: u64,
    /// Records requested per page
    pub page_size: usize,
    /// Upper bound on a single HTTP exchange (enforced by the transport)
    pub request_timeout_secs: u64,
    /// Quiet period before a visible-set change is laid out
    pub layout_debounce_ms: u64,
    /// Children shown per page under a single node
    pub default_children_page_size: usize,
    /// Upload settings
    pub upload: UploadConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            min_interval_ms: 200,
            cache_ttl_secs: 30,
            page_size: 1000,
            request_timeout_secs: 30,
            layout_debounce_ms: 150,
            default_children_page_size: 10,
            upload: UploadConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a YAML config file; absent fields keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!("Loading engine config from {:?}", path);
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `AGENCYGRAPH_*` environment variables
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("AGENCYGRAPH_BASE_URL") {
            self.base_url = url;
        }
        if let Some(v) = env_number("AGENCYGRAPH_MIN_INTERVAL_MS") {
            self.min_interval_ms = v;
        }
        if let Some(v) = env_number("AGENCYGRAPH_CACHE_TTL_SECS") {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = env_number("AGENCYGRAPH_PAGE_SIZE") {
            self.page_size = v as usize;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.upload.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "upload.poll_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.default_children_page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "default_children_page_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn layout_debounce(&self) -> Duration {
        Duration::from_millis(self.layout_debounce_ms)
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
