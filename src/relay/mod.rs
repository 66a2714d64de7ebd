//! WebSocket connection to the signaling relay.
//!
//! One logical link per client. The link announces the local identity with a
//! `join` frame as soon as the socket opens and reconnects with back-off when
//! the socket drops. Nothing is buffered across disconnects.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ReconnectPolicy;
use crate::error::RelayError;
use crate::session::Identity;
use crate::signaling::{decode_frame, encode_frame, SignalingMessage};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Socket open and `join` sent.
    Opened,
    Message(SignalingMessage),
    Closed { reason: String },
}

/// What the call controller needs from a relay connection.
#[async_trait]
pub trait RelayPort: Send + Sync {
    /// Open the link for `identity`, replacing any previous link.
    async fn connect(&self, identity: Identity) -> Result<(), RelayError>;

    /// Hand one message to the open link.
    fn send(&self, message: &SignalingMessage) -> Result<(), RelayError>;

    fn is_open(&self) -> bool;

    async fn disconnect(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Shared {
    /// Present only while a socket is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

pub struct RelayLink {
    url: Url,
    reconnect: ReconnectPolicy,
    events: mpsc::UnboundedSender<RelayEvent>,
    shared: Arc<Shared>,
}

pub fn parse_relay_url(raw: &str) -> Result<Url, RelayError> {
    let url = Url::parse(raw).map_err(|e| RelayError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(RelayError::InvalidUrl(format!("unsupported scheme {other}"))),
    }
}

impl RelayLink {
    pub fn new(
        url: &str,
        reconnect: ReconnectPolicy,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            url: parse_relay_url(url)?,
            reconnect,
            events,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RelayPort for RelayLink {
    async fn connect(&self, identity: Identity) -> Result<(), RelayError> {
        self.disconnect().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_link(
            self.url.clone(),
            identity,
            self.reconnect.clone(),
            Arc::clone(&self.shared),
            self.events.clone(),
            cancel.clone(),
        ));
        *lock(&self.shared.task) = Some((cancel, task));
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> Result<(), RelayError> {
        let frame = encode_frame(message)?;
        let guard = lock(&self.shared.outbound);
        let Some(tx) = guard.as_ref() else {
            warn!(kind = message.kind(), "relay link not open, dropping message");
            return Err(RelayError::NotOpen);
        };
        tx.send(frame).map_err(|_| RelayError::NotOpen)
    }

    fn is_open(&self) -> bool {
        lock(&self.shared.outbound).is_some()
    }

    async fn disconnect(&self) {
        let previous = lock(&self.shared.task).take();
        let Some((cancel, task)) = previous else {
            return;
        };
        cancel.cancel();
        if tokio::time::timeout(DISCONNECT_TIMEOUT, task).await.is_err() {
            warn!("relay link did not shut down in time");
        }
        *lock(&self.shared.outbound) = None;
    }
}

async fn run_link(
    url: Url,
    identity: Identity,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<RelayEvent>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = connect_async(url.as_str()) => res,
        };
        match connected {
            Ok((ws, _)) => {
                attempt = 0;
                info!(relay = %url, user = %identity, "relay connected");
                let reason = match serve(ws, &identity, &shared, &events, &cancel).await {
                    Ok(reason) => reason,
                    Err(e) => e.to_string(),
                };
                *lock(&shared.outbound) = None;
                info!(relay = %url, "relay disconnected: {reason}");
                let _ = events.send(RelayEvent::Closed { reason });
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                let err = RelayError::from(e);
                warn!(relay = %url, attempt, "relay connect failed: {err}");
                if attempt == 0 {
                    let _ = events.send(RelayEvent::Closed {
                        reason: err.to_string(),
                    });
                }
            }
        }

        attempt += 1;
        if policy.exhausted(attempt) {
            warn!(relay = %url, "giving up on relay after {} attempts", attempt - 1);
            break;
        }
        let delay = policy.delay(attempt);
        debug!(relay = %url, ?delay, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Pump one open socket until it closes. Returns the reason of an orderly
/// close.
async fn serve(
    ws: WsStream,
    identity: &Identity,
    shared: &Shared,
    events: &mpsc::UnboundedSender<RelayEvent>,
    cancel: &CancellationToken,
) -> Result<String, RelayError> {
    let (mut write, mut read) = ws.split();

    let join = SignalingMessage::Join {
        username: identity.clone(),
    };
    write.send(Message::Text(encode_frame(&join)?)).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *lock(&shared.outbound) = Some(tx);
    let _ = events.send(RelayEvent::Opened);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok("disconnected".into());
            }
            out = rx.recv() => {
                let Some(text) = out else { continue };
                write.send(Message::Text(text)).await?;
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(txt))) => deliver(events, &txt),
                Some(Ok(Message::Binary(bin))) => {
                    if let Ok(txt) = String::from_utf8(bin) {
                        deliver(events, &txt);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by relay".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok("connection closed".into()),
            },
        }
    }
}

fn deliver(events: &mpsc::UnboundedSender<RelayEvent>, raw: &str) {
    if let Some(msg) = decode_frame(raw) {
        debug!(kind = msg.kind(), "relay frame");
        let _ = events.send(RelayEvent::Message(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_requires_websocket_scheme() {
        assert!(parse_relay_url("ws://localhost:8080").is_ok());
        assert!(parse_relay_url("wss://relay.example.org/ws").is_ok());
        assert!(matches!(
            parse_relay_url("http://localhost:8080"),
            Err(RelayError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_relay_url("not a url"),
            Err(RelayError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn send_before_connect_is_not_open() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = RelayLink::new("ws://127.0.0.1:9", ReconnectPolicy::default(), tx).unwrap();
        assert!(!link.is_open());
        let err = link
            .send(&SignalingMessage::Chat {
                from: "A".into(),
                to: "B".into(),
                message: "hi".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::NotOpen));
        link.disconnect().await;
    }
}
