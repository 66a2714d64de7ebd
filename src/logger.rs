use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::peer::types::IceCandidate;

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level; calling this more than once keeps the first subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nexora={},webrtc=warn", config.level)));

    let builder = fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        debug!("tracing subscriber already installed");
    }
}

/// Trace a trickled ICE candidate.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}
