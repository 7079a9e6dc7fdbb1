use thiserror::Error;

/// Errors returned by the core rule and measurement operations.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rule '{candidate}' collides with active rule '{existing}' on the same match key")]
    Conflict { existing: String, candidate: String },

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("kernel operation '{syscall}' failed: {message}")]
    Kernel { syscall: &'static str, message: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("network error: {0}")]
    Network(#[source] std::io::Error),

    #[error("timed out with {outstanding} reflection(s) outstanding")]
    Timeout { outstanding: u32 },

    #[error("canceled by operator")]
    Canceled,
}

impl NodeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        NodeError::InvalidArgument(msg.into())
    }

    pub fn kernel(syscall: &'static str, message: impl Into<String>) -> Self {
        NodeError::Kernel { syscall, message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
