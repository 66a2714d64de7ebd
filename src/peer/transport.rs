//! Capability seams for media capture and the peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::track::track_local::TrackLocal;

use super::types::{IceCandidate, MediaConstraints, SessionDescription, TrackKind};
use crate::error::TransportError;

/// One local track handed to the transport.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub local: Arc<dyn TrackLocal + Send + Sync>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Handle to acquired local media. Dropping it does not stop capture;
/// hand it back to [`MediaSource::release`].
#[derive(Debug)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
    stopped: CancellationToken,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            stopped: CancellationToken::new(),
        }
    }

    /// Signals whoever feeds the tracks to stop.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Token a capture loop can await to learn the stream was stopped.
    pub fn stopped_token(&self) -> CancellationToken {
        self.stopped.clone()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, TransportError>;

    fn release(&self, stream: MediaStream);
}

/// Callbacks of a peer connection, delivered as a stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { id: String, kind: TrackKind },
    Connected,
    /// The connection dropped and did not recover within the grace period,
    /// or was closed.
    Disconnected,
    Failed(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: &SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Creates one transport; its callbacks are sent to `events`.
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
