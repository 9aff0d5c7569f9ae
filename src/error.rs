//! Error types for the query orchestration subsystem.

use std::time::Duration;
use thiserror::Error;

/// Crate-wide error for backend, configuration and pipeline failures.
///
/// Cloneable so that a single initialization or classification result can be
/// handed to every waiter that shared it.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Provider request failed: {0}")]
    ProviderRequestFailed(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuthFailed(String),

    #[error("Provider rate limit exceeded: {0}")]
    ProviderRateLimit(String),

    #[error("Provider model not found: {0}")]
    ProviderModelNotFound(String),

    #[error("Provider request timed out: {0}")]
    ProviderTimeout(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Retrieval index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Intent classification failed: {0}")]
    ClassificationFailed(String),

    #[error("Stream failed: {0}")]
    StreamFailed(String),

    #[error("Unsupported context: {0}")]
    UnsupportedContext(String),

    #[error("Wiki search failed: {0}")]
    WikiSearchFailed(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

/// Why an engine could not be brought up for a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineInitError {
    #[error("credentials are not configured")]
    MissingCredentials,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("no retrieval index for '{0}'")]
    IndexMissing(String),

    #[error("initialization timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineInitError {
    /// Map a backend error raised during construction onto the init taxonomy.
    pub fn from_api(err: &ApiError) -> Self {
        match err {
            ApiError::MissingCredentials(_) | ApiError::ProviderAuthFailed(_) => {
                EngineInitError::MissingCredentials
            }
            ApiError::IndexUnavailable(key) => EngineInitError::IndexMissing(key.clone()),
            other => EngineInitError::BackendUnavailable(other.to_string()),
        }
    }
}
