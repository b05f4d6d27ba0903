use crate::peer::state::NegotiatorState;

/// Failures reported by a relay store.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Network, read or write failure against the shared store.
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay payload could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no peer connection; call initialize() first")]
    NotInitialized,

    #[error("{op} is not allowed in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: NegotiatorState,
    },

    /// A remote description or candidate could not be parsed.
    #[error("malformed remote data: {0}")]
    Malformed(String),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The coordinator was closed while the attempt was in flight.
    #[error("pairing closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config validation error: {0}")]
    Invalid(String),
}
