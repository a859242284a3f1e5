use thiserror::Error;

/// Engine-wide error taxonomy. The `kind` strings surface verbatim in the
/// HTTP error body, so variants map one-to-one onto the wire contract.
#[derive(Error, Debug)]
pub enum OrraError {
    #[error("validation error: {message}")]
    Validation {
        param: Option<String>,
        message: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("not actionable: {0}")]
    NotActionable(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrraError {
    pub fn validation(message: impl Into<String>) -> Self {
        OrraError::Validation {
            param: None,
            message: message.into(),
        }
    }

    pub fn validation_param(param: impl Into<String>, message: impl Into<String>) -> Self {
        OrraError::Validation {
            param: Some(param.into()),
            message: message.into(),
        }
    }

    /// Wire-facing error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            OrraError::Validation { .. } => "validation",
            OrraError::Unauthorized(_) => "unauthorized",
            OrraError::NotFound(_) => "not found",
            OrraError::InvalidOperation(_) | OrraError::NotActionable(_) => "invalid operation",
            OrraError::Transient(_)
            | OrraError::Io(_)
            | OrraError::Serialization(_)
            | OrraError::Store(_)
            | OrraError::Internal(_) => "internal",
        }
    }

    pub fn param(&self) -> Option<&str> {
        match self {
            OrraError::Validation { param, .. } => param.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrraError>;
