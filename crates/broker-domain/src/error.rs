/// Shared error type used across all broker crates.
///
/// Variants map directly onto the error kinds in the broker's error-handling
/// design: transport/codec failures are contained by callers, routing-layer
/// failures are logged and the offending message dropped, backend-layer
/// failures degrade the session rather than propagate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("auth required: {0}")]
    AuthRequired(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
