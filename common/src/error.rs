use thiserror::Error;

/// Error kinds shared across the agent and relay, per the error-handling
/// design: each command result and retry loop classifies its failure into
/// one of these before surfacing or retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("subscription limit reached: {0}")]
    SubscriptionLimit(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short machine-readable tag, used when a classified error must be
    /// reported back to the cloud as a structured detail field.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NetworkUnreachable(_) => "network_unreachable",
            CoreError::AuthFailed(_) => "auth_failed",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Timeout(_) => "timeout",
            CoreError::ProtocolError(_) => "protocol_error",
            CoreError::ResourceUnavailable(_) => "resource_unavailable",
            CoreError::SubscriptionLimit(_) => "subscription_limit",
            CoreError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
