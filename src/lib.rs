pub mod call;
pub mod chat;
pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod notice;
pub mod peer;
pub mod presence;
pub mod relay;
pub mod session;
pub mod signaling;
mod utils;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;

pub use call::{CallController, Snapshot};
pub use commands::{ClientHandle, Intent};
pub use config::Config;
pub use error::CallError;
pub use session::{Identity, Phase};

use peer::{MediaSource, RtcTransportFactory};
use relay::RelayLink;

/// Start a client: relay link, webrtc-rs transports and the controller task.
/// Must be called from within a tokio runtime.
pub fn start(config: Config, media: Arc<dyn MediaSource>) -> anyhow::Result<ClientHandle> {
    config.validate()?;
    logger::init_logging(&config.logging);

    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let relay = RelayLink::new(&config.relay_url, config.reconnect.clone(), relay_tx)
        .context("relay link")?;
    info!(relay = %relay.url(), "starting client");

    let factory = Arc::new(RtcTransportFactory::new(config.ice_servers.clone()));
    let controller = CallController::new(&config, Arc::new(relay), relay_rx, factory, media);
    Ok(ClientHandle::spawn(controller))
}
