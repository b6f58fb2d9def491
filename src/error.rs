use thiserror::Error;

use crate::capabilities::api::ApiError;
use crate::capabilities::kv::KvError;

/// Crate-wide error taxonomy.
///
/// `TransportUnavailable` is recovered locally through the offline state
/// machine and is never surfaced to the UI as a blocking error.
/// `Unauthorized` and `GraceExpired` are the only conditions that force a
/// hard session reset.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("remote service unreachable: {0}")]
    TransportUnavailable(String),

    #[error("credentials rejected by the remote service")]
    Unauthorized,

    #[error("offline grace period has expired")]
    GraceExpired,

    #[error("remote call failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ApiError> for CoreError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(msg) => Self::TransportUnavailable(msg),
            ApiError::Timeout(ms) => Self::TransportUnavailable(format!("timed out after {ms} ms")),
            ApiError::Unauthorized => Self::Unauthorized,
            ApiError::Status { status, message } => Self::Api { status, message },
            ApiError::Decode(msg) => Self::Api {
                status: 0,
                message: format!("malformed response: {msg}"),
            },
            ApiError::InvalidRequest(msg) => Self::Api {
                status: 0,
                message: format!("invalid request: {msg}"),
            },
        }
    }
}

impl CoreError {
    /// True for failures that should flip the session into the offline path
    /// instead of being reported to the caller.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }
}
