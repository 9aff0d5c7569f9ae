//! FallbackRouter: failure classification and recovery decisions.

use crate::error::ApiError;

/// Shown verbatim when the provider throttles us. Never followed by an
/// automatic fallback.
pub const RATE_LIMIT_MESSAGE: &str =
    "Rate limit reached: the AI service is throttling requests. Please wait a minute and try again.";

const RATE_LIMIT_MARKERS: &[&str] = &["api_rate_limit", "quota", "rate limit", "429"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableKind {
    Timeout,
    Connection,
    Credentials,
    Index,
    Model,
}

impl UnavailableKind {
    /// Worth retrying without user involvement.
    pub fn is_transient(self) -> bool {
        matches!(self, UnavailableKind::Timeout | UnavailableKind::Connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited,
    BackendUnavailable(UnavailableKind),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackAction {
    /// Report to the user and stop
    Surface(String),
    /// Re-issue the same request
    Retry,
    /// Redirect to a wiki search with the rewritten query
    FallbackToWiki,
}

#[derive(Debug, Clone)]
pub struct FallbackRouter {
    max_retries: usize,
}

impl FallbackRouter {
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }

    pub fn classify(error: &ApiError) -> FailureClass {
        match error {
            ApiError::ProviderRateLimit(_) => return FailureClass::RateLimited,
            ApiError::ProviderTimeout(_) => {
                return FailureClass::BackendUnavailable(UnavailableKind::Timeout)
            }
            ApiError::ProviderUnavailable(_) => {
                return FailureClass::BackendUnavailable(UnavailableKind::Connection)
            }
            ApiError::MissingCredentials(_) | ApiError::ProviderAuthFailed(_) => {
                return FailureClass::BackendUnavailable(UnavailableKind::Credentials)
            }
            ApiError::IndexUnavailable(_) => {
                return FailureClass::BackendUnavailable(UnavailableKind::Index)
            }
            ApiError::ProviderModelNotFound(_) => {
                return FailureClass::BackendUnavailable(UnavailableKind::Model)
            }
            _ => {}
        }

        // Some backends only report throttling in the message text
        let message = error.to_string().to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| message.contains(m)) {
            FailureClass::RateLimited
        } else {
            FailureClass::Unknown
        }
    }

    /// Decide what to do about a generation failure.
    ///
    /// `attempt` counts retries already spent on this request.
    pub fn decide(&self, error: &ApiError, has_output: bool, attempt: usize) -> FallbackAction {
        match Self::classify(error) {
            FailureClass::RateLimited => FallbackAction::Surface(RATE_LIMIT_MESSAGE.to_string()),
            // A partial answer is already on screen; redirecting would hide it
            _ if has_output => FallbackAction::Surface(format!("Answer interrupted: {}", error)),
            FailureClass::BackendUnavailable(kind)
                if kind.is_transient() && attempt < self.max_retries =>
            {
                FallbackAction::Retry
            }
            FailureClass::BackendUnavailable(_) | FailureClass::Unknown => {
                FallbackAction::FallbackToWiki
            }
        }
    }

    /// User-facing text for a failure that is surfaced directly.
    pub fn user_message(error: &ApiError) -> String {
        match Self::classify(error) {
            FailureClass::RateLimited => RATE_LIMIT_MESSAGE.to_string(),
            _ => error.to_string(),
        }
    }
}

/// Message reported when both the primary path and the wiki fallback failed.
pub fn compound_error(primary: &str, fallback: &ApiError) -> String {
    format!("{}; wiki search fallback also failed: {}", primary, fallback)
}
