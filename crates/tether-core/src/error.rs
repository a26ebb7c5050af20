//! Error types for Tether
//!
//! Variants map onto the abstract error kinds in the specification's error
//! handling design. Each one carries enough context to be rendered as a
//! single human-readable `error` control event or HTTP status at the
//! boundary where it is caught.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("invalid or missing token")]
    AuthFailure,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to start session: {0}")]
    Spawn(String),

    #[error("adoption failed: {0}")]
    Adoption(String),

    #[error("{0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TetherError>;
