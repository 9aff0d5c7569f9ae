//! CLI output: error mapping from domain errors to the CLI surface.

use crate::error::ApiError;

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::MissingCredentials(msg) => format!(
            "No API key configured ({}). Wiki search still works; guide answers need a key.",
            msg
        ),
        other => other.to_string(),
    }
}
