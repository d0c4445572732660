//! Error types for the moltgate policy core.

use thiserror::Error;

/// Errors raised while loading policy inputs.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Failed to read allowlist {path}: {source}")]
    AllowlistRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse allowlist {path}: {source}")]
    AllowlistParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type alias for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;
