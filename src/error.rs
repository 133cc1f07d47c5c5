use thiserror::Error;

/// Error taxonomy for the realtime client.
///
/// `InvalidParameter` and `InvalidRequest` are always surfaced synchronously
/// and never retried. `Transport` failures feed the bounded reconnect loop
/// instead of individual callers. `Negotiation` failures are contained to one
/// peer session and usually reach the caller through that peer's event sink
/// rather than a `Result`.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Malformed or missing caller input.
    #[error("INVALID_PARAMETER: {0}")]
    InvalidParameter(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("INVALID_REQUEST: {0}")]
    InvalidRequest(String),

    /// Network-level failure of the relay control channel.
    #[error("signaling transport: {0}")]
    Transport(String),

    /// ICE/SDP application failure local to one peer session.
    #[error("negotiation with {peer}: {reason}")]
    Negotiation { peer: String, reason: String },
}

impl RealtimeError {
    pub(crate) fn invalid_parameter(message: impl Into<String>) -> Self {
        RealtimeError::InvalidParameter(message.into())
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        RealtimeError::InvalidRequest(message.into())
    }

    pub(crate) fn transport(message: impl std::fmt::Display) -> Self {
        RealtimeError::Transport(message.to_string())
    }

    pub(crate) fn negotiation(peer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RealtimeError::Negotiation {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::InvalidParameter(_) => "INVALID_PARAMETER",
            RealtimeError::InvalidRequest(_) => "INVALID_REQUEST",
            RealtimeError::Transport(_) => "TRANSPORT_ERROR",
            RealtimeError::Negotiation { .. } => "NEGOTIATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
