pub mod connection;
pub mod ice;
pub mod media;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod negotiator;
pub mod transport;
pub mod types;

pub use connection::RtcTransportFactory;
pub use media::StaticTrackSource;
pub use negotiator::{NegotiationStatus, NegotiatorEvent, SessionNegotiator};
pub use transport::{
    MediaSource, MediaStream, MediaTrack, PeerTransport, PeerTransportFactory, TransportEvent,
};
pub use types::{IceCandidate, MediaConstraints, SessionDescription, ServerConfig, TrackKind};
