//! Error types for the call core.
//!
//! Nothing here is fatal to the process: every failure is contained by the
//! controller and resolves to a resting phase.

use thiserror::Error;

use crate::session::Phase;

/// Errors surfaced to the presentation layer for user actions.
#[derive(Debug, Error)]
pub enum CallError {
    /// Missing identity pair, empty chat text and similar input problems.
    #[error("{0}")]
    Validation(String),

    /// A call is already being set up or in progress.
    #[error("already in a call ({0:?})")]
    Busy(Phase),

    #[error("{op} is not valid while {phase:?}")]
    InvalidPhase { op: &'static str, phase: Phase },

    #[error("relay connection is not open")]
    RelayUnavailable,

    #[error("client has shut down")]
    Shutdown,
}

impl CallError {
    pub fn identities_required() -> Self {
        CallError::Validation("Please select both users before connecting or calling.".into())
    }
}

/// Media or peer transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("media unavailable: {0}")]
    Media(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("peer connection failed: {0}")]
    ConnectionFailed(String),

    #[error("transport already closed")]
    Closed,

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

/// Failures of one negotiation step.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("negotiation already started for session {0}")]
    AlreadyStarted(String),

    /// The step arrived in an order the negotiation does not expect.
    #[error("protocol order: {0}")]
    ProtocolOrder(&'static str),

    /// The negotiation was closed while the step was outstanding.
    #[error("negotiation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay link is not open")]
    NotOpen,

    #[error("relay url: {0}")]
    InvalidUrl(String),

    #[error("encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
