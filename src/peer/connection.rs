//! webrtc-rs backed [`PeerTransport`]: one `RTCPeerConnection` per call.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::transport::{MediaTrack, PeerTransport, PeerTransportFactory, TransportEvent};
use super::types::{IceCandidate, SdpType, ServerConfig, SessionDescription, TrackKind};
use crate::error::TransportError;
use crate::utils::add_ice_url_scheme;

/// How long a disconnected connection gets to recover before the call is
/// considered over.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds peer connections with the configured ICE servers.
pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.ice_servers)).await?);
        attach_handlers(&pc, events);
        Ok(Box::new(RtcPeerTransport { pc }))
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let ice_events = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let events = ice_events.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                debug!("ICE candidate gathering completed");
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("failed to serialize local candidate: {e}"),
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let _ = events.send(TransportEvent::RemoteTrack {
                    id: track.id().to_string(),
                    kind,
                });
            })
        },
    ));

    let weak = Arc::downgrade(pc);
    let grace: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("peer connection state changed to {st}");
        match st {
            RTCPeerConnectionState::Connected => {
                cancel_grace(&grace);
                let _ = events.send(TransportEvent::Connected);
            }
            RTCPeerConnectionState::Disconnected => {
                let mut pending = lock(&grace);
                if pending.as_ref().is_some_and(|h| !h.is_finished()) {
                    debug!("disconnect grace period already running");
                } else {
                    *pending = Some(tokio::spawn(await_recovery(weak.clone(), events.clone())));
                }
            }
            RTCPeerConnectionState::Failed => {
                cancel_grace(&grace);
                let _ = events.send(TransportEvent::Failed("ICE connection failed".into()));
            }
            RTCPeerConnectionState::Closed => {
                cancel_grace(&grace);
                let _ = events.send(TransportEvent::Disconnected);
            }
            _ => {}
        }
        Box::pin(async {})
    }));
}

fn cancel_grace(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(handle) = lock(slot).take() {
        handle.abort();
    }
}

async fn await_recovery(
    pc: Weak<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    info!("grace period started, waiting {} s", GRACE_PERIOD.as_secs());
    tokio::time::sleep(GRACE_PERIOD).await;
    let state = pc.upgrade().map(|pc| pc.connection_state());
    if state == Some(RTCPeerConnectionState::Connected) {
        info!("connection recovered during grace period");
        return;
    }
    warn!(?state, "connection did not recover");
    let _ = events.send(TransportEvent::Disconnected);
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp.clone();
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(TransportError::InvalidDescription(
                "rollback is not supported".into(),
            ))
        }
    };
    rtc.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::InvalidDescription("unspecified sdp type".into()))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let sender = self.pc.add_track(Arc::clone(&track.local)).await?;
        // RTCP must be read for interceptors to work; ends when the sender closes.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}
