use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::transport::{MediaSource, MediaStream, MediaTrack};
use super::types::{MediaConstraints, TrackKind};
use crate::error::TransportError;
use crate::utils::random_id;

/// Media source backed by sample tracks (Opus audio, VP8 video).
///
/// The embedding application writes encoded samples into the tracks of the
/// acquired stream until [`MediaStream::stopped_token`] fires.
#[derive(Debug, Default)]
pub struct StaticTrackSource;

fn sample_track(kind: TrackKind, stream_id: &str) -> MediaTrack {
    let (mime, label) = match kind {
        TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
        TrackKind::Video => (MIME_TYPE_VP8, "video"),
    };
    let id = format!("{label}-{}", random_id());
    let local = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime.to_owned(),
            ..Default::default()
        },
        id.clone(),
        stream_id.to_owned(),
    ));
    MediaTrack { id, kind, local }
}

#[async_trait]
impl MediaSource for StaticTrackSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, TransportError> {
        if !constraints.audio && !constraints.video {
            return Err(TransportError::Media("no audio or video requested".into()));
        }
        let stream_id = format!("stream-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(sample_track(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(sample_track(TrackKind::Video, &stream_id));
        }
        debug!(stream = %stream_id, tracks = tracks.len(), "acquired local media");
        Ok(MediaStream::new(stream_id, tracks))
    }

    fn release(&self, stream: MediaStream) {
        debug!(stream = %stream.id, "stopping local media");
        stream.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_requested_tracks() {
        let source = StaticTrackSource;
        let stream = source
            .acquire(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(stream.tracks.len(), 1);
        assert_eq!(stream.tracks[0].kind, TrackKind::Audio);

        let token = stream.stopped_token();
        source.release(stream);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn empty_constraints_fail() {
        let err = StaticTrackSource
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Media(_)));
    }
}
