use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peer::types::{IceCandidate, SessionDescription, TrackKind};
use crate::utils::random_id;

/// Peer name as announced to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity::new(s)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity::new(s)
    }
}

/// Identifies one call attempt; stale results are matched against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(random_id())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Lifecycle phase of the call core.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Outbound: offer being prepared or sent, awaiting answer.
    Calling,
    /// Inbound offer received, awaiting local accept/reject.
    Ringing,
    Active,
    /// Resting phase after a transport failure. Behaves like `Idle`.
    Failed,
}

impl Phase {
    /// True when no session exists and a new one may be created.
    pub fn is_resting(self) -> bool {
        matches!(self, Phase::Idle | Phase::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The single call being set up or in progress.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub local: Identity,
    pub remote: Identity,
    pub role: Role,
    pub phase: Phase,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    /// Local candidates gathered before our description went out.
    pub pending_local_candidates: VecDeque<IceCandidate>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub media_connected: bool,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn outgoing(local: Identity, remote: Identity) -> Self {
        Self::new(local, remote, Role::Caller, Phase::Calling, None)
    }

    pub fn incoming(local: Identity, remote: Identity, offer: SessionDescription) -> Self {
        Self::new(local, remote, Role::Callee, Phase::Ringing, Some(offer))
    }

    fn new(
        local: Identity,
        remote: Identity,
        role: Role,
        phase: Phase,
        remote_description: Option<SessionDescription>,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            local,
            remote,
            role,
            phase,
            local_description: None,
            remote_description,
            pending_local_candidates: VecDeque::new(),
            remote_tracks: Vec::new(),
            media_connected: false,
            created_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> chrono::TimeDelta {
        Utc::now() - self.created_at
    }

    /// Whether `from` is this session's counterpart.
    pub fn is_counterpart(&self, from: &Identity) -> bool {
        &self.remote == from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_trims_whitespace() {
        assert_eq!(Identity::new("  Abhi ").as_str(), "Abhi");
        assert!(Identity::new("   ").is_empty());
    }

    #[test]
    fn incoming_session_holds_offer() {
        let s = CallSession::incoming("b".into(), "a".into(), SessionDescription::offer("o1"));
        assert_eq!(s.role, Role::Callee);
        assert_eq!(s.phase, Phase::Ringing);
        assert!(s.remote_description.is_some());
        assert!(s.is_counterpart(&"a".into()));
        assert!(!s.is_counterpart(&"c".into()));
    }

    #[test]
    fn elapsed_counts_from_creation() {
        let mut s = CallSession::outgoing("a".into(), "b".into());
        s.created_at -= chrono::TimeDelta::seconds(30);
        assert!(s.elapsed().num_seconds() >= 30);
    }

    #[test]
    fn failed_phase_is_resting() {
        assert!(Phase::Failed.is_resting());
        assert!(Phase::Idle.is_resting());
        assert!(!Phase::Calling.is_resting());
    }
}
