//! Relay wire format: one JSON object per frame, tagged by `type`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::Identity;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Join {
        username: Identity,
    },
    Chat {
        from: Identity,
        to: Identity,
        message: String,
    },
    Offer {
        from: Identity,
        to: Identity,
        offer: SessionDescription,
    },
    Answer {
        from: Identity,
        to: Identity,
        answer: SessionDescription,
    },
    IceCandidate {
        from: Identity,
        to: Identity,
        candidate: IceCandidate,
    },
    CallRejected {
        from: Identity,
        to: Identity,
    },
    /// Explicit end-of-call notice; only sent when enabled in config.
    HangUp {
        from: Identity,
        to: Identity,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Chat { .. } => "chat",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::CallRejected { .. } => "call-rejected",
            SignalingMessage::HangUp { .. } => "hang-up",
        }
    }

    pub fn from(&self) -> Option<&Identity> {
        match self {
            SignalingMessage::Join { .. } => None,
            SignalingMessage::Chat { from, .. }
            | SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::CallRejected { from, .. }
            | SignalingMessage::HangUp { from, .. } => Some(from),
        }
    }

    pub fn to(&self) -> Option<&Identity> {
        match self {
            SignalingMessage::Join { .. } => None,
            SignalingMessage::Chat { to, .. }
            | SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. }
            | SignalingMessage::CallRejected { to, .. }
            | SignalingMessage::HangUp { to, .. } => Some(to),
        }
    }
}

pub fn encode_frame(msg: &SignalingMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Decodes one relay frame. Malformed frames (not JSON, no or unknown
/// `type`, missing fields) yield `None` and are only traced.
pub fn decode_frame(raw: &str) -> Option<SignalingMessage> {
    match serde_json::from_str::<SignalingMessage>(raw) {
        Ok(msg) => Some(msg),
        Err(err) => {
            debug!(error = %err, len = raw.len(), "dropping malformed relay frame");
            None
        }
    }
}
