/**
 * error.rs
 *
 * Error taxonomy for session negotiation
 */

use std::io;
use thiserror::Error;

/// Failures talking to the traversal server
#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("traversal server unreachable: {0}")]
    Unreachable(String),

    #[error("traversal server rejected request: {0}")]
    Rejected(String),

    #[error("host code not found: {0}")]
    HostCodeNotFound(String),
}

/// Terminal failures of a session attempt.
///
/// Every variant ends the attempt; nothing is retried by the core.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {target}: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("traversal server unreachable: {0}")]
    TraversalUnreachable(String),

    #[error("traversal server rejected request: {0}")]
    TraversalServerRejected(String),

    #[error("host code not found: {0}")]
    HostCodeNotFound(String),

    #[error("traversal registration failed: {0}")]
    TraversalRegistrationFailed(#[source] TraversalError),

    #[error("a session is already open")]
    SessionAlreadyOpen,

    #[error("session attempt cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SessionError::InvalidParameters(message.into())
    }

    pub(crate) fn connect_failed(target: impl Into<String>, reason: impl ToString) -> Self {
        SessionError::ConnectFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable numeric code, used across the C ABI
    pub fn code(&self) -> i32 {
        match self {
            SessionError::InvalidParameters(_) => 1,
            SessionError::BindFailed { .. } => 2,
            SessionError::ConnectFailed { .. } => 3,
            SessionError::TraversalUnreachable(_) => 4,
            SessionError::TraversalServerRejected(_) => 5,
            SessionError::HostCodeNotFound(_) => 6,
            SessionError::TraversalRegistrationFailed(_) => 7,
            SessionError::SessionAlreadyOpen => 8,
            SessionError::Cancelled => 9,
        }
    }
}

/// Resolution failures keep their kind when surfaced by a client attempt
impl From<TraversalError> for SessionError {
    fn from(err: TraversalError) -> Self {
        match err {
            TraversalError::Unreachable(e) => SessionError::TraversalUnreachable(e),
            TraversalError::Rejected(e) => SessionError::TraversalServerRejected(e),
            TraversalError::HostCodeNotFound(code) => SessionError::HostCodeNotFound(code),
        }
    }
}
