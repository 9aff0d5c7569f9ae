//! Configuration System
//!
//! Layered configuration for provider credentials, query timeouts, the
//! site-mapping table and logging. Files are read, never written.

use crate::error::ApiError;
use crate::logging::LoggingConfig;
use crate::provider::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Model provider used for classification, generation and grounding
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Query pipeline tuning
    #[serde(default)]
    pub query: QuerySettings,

    /// Retrieval index location
    #[serde(default)]
    pub index: IndexConfig,

    /// Opt-in web-search grounding fallback
    #[serde(default)]
    pub grounding: GroundingConfig,

    /// Window-title to engine/wiki mapping
    #[serde(default)]
    pub sites: Vec<SiteEntry>,

    /// Window titles belonging to the assistant itself
    #[serde(default = "default_ignored_windows")]
    pub ignored_windows: Vec<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            query: QuerySettings::default(),
            index: IndexConfig::default(),
            grounding: GroundingConfig::default(),
            sites: Vec::new(),
            ignored_windows: default_ignored_windows(),
            logging: LoggingConfig::default(),
        }
    }
}

pub(crate) fn default_ignored_windows() -> Vec<String> {
    ["gamewiki assistant", "gamewiki", "game wiki assistant", "game wiki"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Timeouts and limits for query processing. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_classification_timeout_ms")]
    pub classification_timeout_ms: u64,
    #[serde(default = "default_engine_wait_timeout_ms")]
    pub engine_wait_timeout_ms: u64,
    #[serde(default = "default_engine_poll_interval_ms")]
    pub engine_poll_interval_ms: u64,
    #[serde(default = "default_engine_init_timeout_ms")]
    pub engine_init_timeout_ms: u64,
    #[serde(default = "default_blocking_wait_ms")]
    pub blocking_wait_ms: u64,
    #[serde(default = "default_stream_retries")]
    pub stream_retries: usize,
}

fn default_top_k() -> usize {
    3
}

fn default_classification_timeout_ms() -> u64 {
    8_000
}

fn default_engine_wait_timeout_ms() -> u64 {
    10_000
}

fn default_engine_poll_interval_ms() -> u64 {
    100
}

fn default_engine_init_timeout_ms() -> u64 {
    60_000
}

fn default_blocking_wait_ms() -> u64 {
    5_000
}

fn default_stream_retries() -> usize {
    1
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            classification_timeout_ms: default_classification_timeout_ms(),
            engine_wait_timeout_ms: default_engine_wait_timeout_ms(),
            engine_poll_interval_ms: default_engine_poll_interval_ms(),
            engine_init_timeout_ms: default_engine_init_timeout_ms(),
            blocking_wait_ms: default_blocking_wait_ms(),
            stream_retries: default_stream_retries(),
        }
    }
}

impl QuerySettings {
    pub fn classification_timeout(&self) -> Duration {
        Duration::from_millis(self.classification_timeout_ms)
    }

    pub fn engine_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_wait_timeout_ms)
    }

    pub fn engine_poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine_poll_interval_ms)
    }

    pub fn engine_init_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_init_timeout_ms)
    }

    pub fn blocking_wait(&self) -> Duration {
        Duration::from_millis(self.blocking_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("data/indexes")
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundingConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// One row of the site-mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    /// Case-insensitive substring of the window title
    pub title: String,
    /// Retrieval engine serving guide queries for this title
    #[serde(default)]
    pub engine_key: Option<String>,
    /// Wiki base URL used for site-scoped searches
    #[serde(default)]
    pub wiki_base_url: Option<String>,
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Provider(String),
    Query(String),
    Site(String, String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Query(msg) => write!(f, "Query: {}", msg),
            ValidationError::Site(title, msg) => write!(f, "Site '{}': {}", title, msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl QuerySettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.top_k == 0 {
            return Err("top_k must be at least 1".to_string());
        }
        if self.engine_poll_interval_ms == 0 {
            return Err("engine_poll_interval_ms must be greater than 0".to_string());
        }
        if self.engine_poll_interval_ms > self.engine_wait_timeout_ms {
            return Err(format!(
                "engine_poll_interval_ms ({}) exceeds engine_wait_timeout_ms ({})",
                self.engine_poll_interval_ms, self.engine_wait_timeout_ms
            ));
        }
        Ok(())
    }
}

impl AssistantConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }

        if let Err(e) = self.query.validate() {
            errors.push(ValidationError::Query(e));
        }

        for site in &self.sites {
            if site.title.trim().is_empty() {
                errors.push(ValidationError::Site(
                    site.title.clone(),
                    "title cannot be empty".to_string(),
                ));
            }
            if site.engine_key.is_none() && site.wiki_base_url.is_none() {
                errors.push(ValidationError::Site(
                    site.title.clone(),
                    "needs an engine_key, a wiki_base_url, or both".to_string(),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold all problems into one `ApiError`.
    pub fn validated(self) -> Result<Self, ApiError> {
        self.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(self)
    }
}
