//! Crate-wide typed error boundary.
//!
//! Internal component code propagates `anyhow::Result` (matching the
//! teacher's `anyhow::Context` idiom); at the edges the CLI and tests
//! observe, errors are converted into this enum so callers can match on
//! the failure kind instead of grepping a message string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShelfBridgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("matching error: {0}")]
    Matching(String),
}

pub type Result<T> = std::result::Result<T, ShelfBridgeError>;
