//! Async driver around [`CallStateMachine`].
//!
//! The controller is the only owner of the machine and the negotiator. It
//! processes one input at a time (user intent, relay event, negotiator
//! event, timer) and executes the resulting commands before taking the next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::machine::{CallStateMachine, Command, NegotiateOp};
use crate::chat::ChatMessage;
use crate::commands::Intent;
use crate::config::Config;
use crate::error::{CallError, NegotiationError};
use crate::notice::ToastSlot;
use crate::peer::negotiator::{NegotiationStatus, NegotiatorEvent, SessionNegotiator};
use crate::peer::transport::{MediaSource, PeerTransportFactory};
use crate::relay::{RelayEvent, RelayPort};
use crate::session::{Identity, Phase, SessionId};

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub phase: Phase,
    pub local: Identity,
    pub remote: Identity,
    pub online: Vec<Identity>,
    /// Caller of a ringing inbound call.
    pub incoming: Option<Identity>,
    pub messages: Vec<ChatMessage>,
    pub toast: Option<String>,
    /// Inline validation error, kept until dismissed.
    pub error: Option<String>,
    pub relay_open: bool,
    pub media_connected: bool,
    pub remote_tracks: usize,
    /// When the current session started.
    pub session_started: Option<DateTime<Utc>>,
}

/// An intent plus an optional channel for its outcome.
pub(crate) struct Request {
    pub intent: Intent,
    pub reply: Option<oneshot::Sender<Result<(), CallError>>>,
}

enum Input {
    Request(Request),
    Relay(RelayEvent),
    Negotiator(NegotiatorEvent),
    RingTimeout(SessionId),
    ToastExpired,
    Closed,
}

pub struct CallController {
    machine: CallStateMachine,
    negotiator: SessionNegotiator,
    relay: Arc<dyn RelayPort>,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    negotiator_events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    toast: ToastSlot,
    error: Option<String>,
    ring_timeout: Option<Duration>,
    ring: Option<(SessionId, Instant)>,
    snapshot: watch::Sender<Snapshot>,
}

impl CallController {
    pub fn new(
        config: &Config,
        relay: Arc<dyn RelayPort>,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        factory: Arc<dyn PeerTransportFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (negotiator_tx, negotiator_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            machine: CallStateMachine::new(config.send_hangup),
            negotiator: SessionNegotiator::new(factory, media, negotiator_tx),
            relay,
            relay_events,
            negotiator_events: negotiator_rx,
            toast: ToastSlot::new(config.toast_ttl()),
            error: None,
            ring_timeout: config.ring_timeout(),
            ring: None,
            snapshot,
        }
    }

    pub fn machine(&self) -> &CallStateMachine {
        &self.machine
    }

    pub fn negotiation_status(&self) -> Option<NegotiationStatus> {
        self.negotiator.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&mut self) -> Snapshot {
        let session = self.machine.session();
        Snapshot {
            phase: self.machine.phase(),
            local: self.machine.presence().local().clone(),
            remote: self.machine.presence().remote().clone(),
            online: self.machine.presence().online().cloned().collect(),
            incoming: self.machine.incoming().cloned(),
            messages: self.machine.messages().to_vec(),
            toast: self.toast.visible().map(|t| t.text.clone()),
            error: self.error.clone(),
            relay_open: self.machine.relay_open(),
            media_connected: session.is_some_and(|s| s.media_connected),
            remote_tracks: session.map_or(0, |s| s.remote_tracks.len()),
            session_started: session.map(|s| s.created_at),
        }
    }

    /// Apply one user intent. Validation errors are also kept for display,
    /// other rejections shown as a notice.
    pub async fn handle_intent(&mut self, intent: Intent) -> Result<(), CallError> {
        let result = self.apply_intent(intent).await;
        match &result {
            Ok(()) => {}
            Err(CallError::Validation(msg)) => self.error = Some(msg.clone()),
            Err(err) => {
                warn!("intent rejected: {err}");
                self.toast.show(err.to_string());
            }
        }
        self.publish();
        result
    }

    async fn apply_intent(&mut self, intent: Intent) -> Result<(), CallError> {
        debug!(?intent, "intent");
        let commands = match intent {
            Intent::Connect => {
                let local = self.machine.presence().local().clone();
                if local.is_empty() {
                    return Err(CallError::Validation(
                        "Please enter your name before connecting.".into(),
                    ));
                }
                self.relay.connect(local).await.map_err(|e| {
                    warn!("relay connect failed: {e}");
                    CallError::RelayUnavailable
                })?;
                Vec::new()
            }
            Intent::SetLocalIdentity(identity) => {
                self.machine.set_local_identity(identity);
                self.error = None;
                Vec::new()
            }
            Intent::SetRemoteIdentity(identity) => {
                self.machine.set_remote_identity(identity);
                self.error = None;
                Vec::new()
            }
            Intent::StartCall(remote) => self.machine.start_call(remote)?,
            Intent::AcceptCall => self.machine.accept()?,
            Intent::RejectCall => self.machine.reject()?,
            Intent::Hangup => self.machine.hangup()?,
            Intent::SendChat(text) => self.machine.send_chat(&text)?,
            Intent::DismissError => {
                self.error = None;
                Vec::new()
            }
        };
        self.execute(commands).await;
        Ok(())
    }

    pub async fn handle_relay_event(&mut self, event: RelayEvent) {
        let commands = self.machine.handle_relay(event);
        self.execute(commands).await;
        self.publish();
    }

    pub async fn handle_negotiator_event(&mut self, event: NegotiatorEvent) {
        let commands = self.machine.handle_negotiator(event);
        self.execute(commands).await;
        self.publish();
    }

    /// Wait for and process one relay, negotiator or timer input.
    pub async fn step(&mut self) {
        match self.next_input(None).await {
            Input::Closed => {}
            input => self.dispatch(input).await,
        }
    }

    /// Process inputs until the request channel closes, then tear down.
    pub(crate) async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        self.publish();
        loop {
            match self.next_input(Some(&mut requests)).await {
                Input::Closed => break,
                input => self.dispatch(input).await,
            }
        }
        self.shutdown().await;
    }

    /// Hang up any call and close the relay link.
    pub async fn shutdown(&mut self) {
        info!("shutting down call controller");
        if !self.machine.phase().is_resting() {
            if let Ok(commands) = self.machine.hangup() {
                self.execute(commands).await;
            }
        }
        self.relay.disconnect().await;
        self.ring = None;
        self.publish();
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Request(Request { intent, reply }) => {
                let result = self.handle_intent(intent).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Input::Relay(event) => self.handle_relay_event(event).await,
            Input::Negotiator(event) => self.handle_negotiator_event(event).await,
            Input::RingTimeout(id) => {
                self.ring = None;
                let commands = self.machine.ring_timeout(&id);
                self.execute(commands).await;
                self.publish();
            }
            Input::ToastExpired => self.publish(),
            Input::Closed => {}
        }
    }

    async fn next_input(
        &mut self,
        requests: Option<&mut mpsc::UnboundedReceiver<Request>>,
    ) -> Input {
        let ring = self.ring.clone();
        let toast = self.toast.deadline();
        tokio::select! {
            req = recv_or_pending(requests) => match req {
                Some(req) => Input::Request(req),
                None => Input::Closed,
            },
            Some(event) = self.relay_events.recv() => Input::Relay(event),
            Some(event) = self.negotiator_events.recv() => Input::Negotiator(event),
            id = wait_ring(ring) => Input::RingTimeout(id),
            _ = wait_deadline(toast) => Input::ToastExpired,
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Send(msg) => {
                    if let Err(e) = self.relay.send(&msg) {
                        warn!(kind = msg.kind(), "failed to send frame: {e}");
                    }
                }
                Command::Negotiate { session, op } => self.negotiate(&session, op),
                Command::CloseNegotiator(id) => {
                    if self.ring.as_ref().is_some_and(|(ring_id, _)| ring_id == &id) {
                        self.ring = None;
                    }
                    self.negotiator.close(&id).await;
                }
                Command::ArmRingTimer(id) => {
                    if let Some(timeout) = self.ring_timeout {
                        self.ring = Some((id, Instant::now() + timeout));
                    }
                }
                Command::Notice(text) => {
                    info!("{text}");
                    self.toast.show(text);
                }
            }
        }
    }

    fn negotiate(&mut self, id: &SessionId, op: NegotiateOp) {
        let Some(session) = self.machine.session().filter(|s| &s.id == id) else {
            debug!(session = %id, "negotiation step for closed session dropped");
            return;
        };
        let result = match op {
            NegotiateOp::CreateOutbound => self.negotiator.create_outbound(session),
            NegotiateOp::CreateInboundAnswer(offer) => {
                self.negotiator.create_inbound_answer(session, offer)
            }
            NegotiateOp::ApplyRemoteAnswer(answer) => {
                self.negotiator.apply_remote_answer(session, answer)
            }
            NegotiateOp::ApplyCandidate(candidate) => {
                self.negotiator.enqueue_or_apply_candidate(session, candidate);
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(e @ (NegotiationError::ProtocolOrder(_) | NegotiationError::AlreadyStarted(_))) => {
                warn!(session = %id, "ignoring negotiation step: {e}");
            }
            Err(e) => warn!(session = %id, "negotiation step failed: {e}"),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.snapshot.send_replace(snapshot);
    }
}

async fn recv_or_pending(
    requests: Option<&mut mpsc::UnboundedReceiver<Request>>,
) -> Option<Request> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_ring(ring: Option<(SessionId, Instant)>) -> SessionId {
    match ring {
        Some((id, at)) => {
            sleep_until(at).await;
            id
        }
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{MockMediaSource, MockTransportFactory};
    use crate::peer::types::SessionDescription;
    use crate::relay::mock::MockRelay;
    use crate::signaling::SignalingMessage;

    struct Fixture {
        controller: CallController,
        relay: Arc<MockRelay>,
        factory: MockTransportFactory,
        media: Arc<MockMediaSource>,
    }

    fn fixture(config: Config) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Arc::new(MockRelay::new(tx));
        let factory = MockTransportFactory::new();
        let media = Arc::new(MockMediaSource::new());
        let controller = CallController::new(
            &config,
            relay.clone(),
            rx,
            Arc::new(factory.clone()),
            media.clone(),
        );
        Fixture {
            controller,
            relay,
            factory,
            media,
        }
    }

    async fn connected(local: &str, remote: &str, config: Config) -> Fixture {
        let mut f = fixture(config);
        let c = &mut f.controller;
        c.handle_intent(Intent::SetLocalIdentity(local.into()))
            .await
            .unwrap();
        c.handle_intent(Intent::SetRemoteIdentity(remote.into()))
            .await
            .unwrap();
        c.handle_intent(Intent::Connect).await.unwrap();
        c.step().await;
        assert!(c.machine().relay_open());
        f.relay.take_sent();
        f
    }

    #[tokio::test]
    async fn connect_requires_local_identity() {
        let mut f = fixture(Config::default());
        let err = f.controller.handle_intent(Intent::Connect).await.unwrap_err();
        assert!(matches!(err, CallError::Validation(_)));
        assert!(f.controller.snapshot().error.is_some());
        assert!(f.relay.sent().is_empty());

        f.controller
            .handle_intent(Intent::DismissError)
            .await
            .unwrap();
        assert!(f.controller.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn connect_joins_and_announces_online() {
        let mut f = fixture(Config::default());
        f.controller
            .handle_intent(Intent::SetLocalIdentity("A".into()))
            .await
            .unwrap();
        f.controller.handle_intent(Intent::Connect).await.unwrap();
        f.controller.step().await;
        assert_eq!(
            f.relay.sent(),
            vec![SignalingMessage::Join {
                username: "A".into()
            }]
        );
        let snap = f.controller.snapshot();
        assert!(snap.relay_open);
        assert_eq!(snap.toast.as_deref(), Some("A is online"));
    }

    #[tokio::test]
    async fn call_without_remote_is_inline_error() {
        let mut f = connected("A", "", Config::default()).await;
        let err = f
            .controller
            .handle_intent(Intent::StartCall(None))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Validation(_)));
        let snap = f.controller.snapshot();
        assert_eq!(
            snap.error.as_deref(),
            Some("Please select both users before connecting or calling.")
        );
        assert_eq!(snap.phase, Phase::Idle);
        assert!(f.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn outbound_call_sends_offer_then_candidates() {
        let mut f = connected("A", "B", Config::default()).await;
        f.controller
            .handle_intent(Intent::StartCall(None))
            .await
            .unwrap();
        assert_eq!(f.controller.snapshot().phase, Phase::Calling);

        // offer + two trickled host candidates
        for _ in 0..3 {
            f.controller.step().await;
        }
        let sent = f.relay.take_sent();
        assert!(matches!(
            &sent[0],
            SignalingMessage::Offer { to, offer, .. } if to == &Identity::new("B") && offer.sdp == "mock-offer-1"
        ));
        assert_eq!(sent.len(), 3);
        assert!(sent[1..]
            .iter()
            .all(|m| matches!(m, SignalingMessage::IceCandidate { .. })));
    }

    #[tokio::test]
    async fn hangup_mid_acquisition_releases_everything() {
        let mut f = connected("A", "B", Config::default()).await;
        f.media.hold();
        f.controller
            .handle_intent(Intent::StartCall(None))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        f.controller.handle_intent(Intent::Hangup).await.unwrap();
        f.media.resume();

        f.relay.inject(SignalingMessage::Answer {
            from: "B".into(),
            to: "A".into(),
            answer: SessionDescription::answer("late"),
        });
        f.controller.step().await;

        let snap = f.controller.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(f.media.live(), 0);
        assert_eq!(f.factory.created(), 0);
        assert!(f.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn busy_offer_is_rejected() {
        let mut f = connected("A", "B", Config::default()).await;
        f.controller
            .handle_intent(Intent::StartCall(None))
            .await
            .unwrap();
        f.relay.inject(SignalingMessage::Offer {
            from: "C".into(),
            to: "A".into(),
            offer: SessionDescription::offer("from-c"),
        });
        loop {
            f.controller.step().await;
            if f
                .relay
                .sent()
                .iter()
                .any(|m| matches!(m, SignalingMessage::CallRejected { .. }))
            {
                break;
            }
        }
        assert_eq!(f.controller.snapshot().phase, Phase::Calling);
        assert_eq!(
            f.controller.machine().session().unwrap().remote,
            Identity::new("B")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let config = Config {
            ring_timeout_secs: 10,
            ..Config::default()
        };
        let mut f = connected("A", "B", config).await;
        f.controller
            .handle_intent(Intent::StartCall(None))
            .await
            .unwrap();
        while f.controller.machine().phase() == Phase::Calling {
            f.controller.step().await;
        }
        let snap = f.controller.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.toast.as_deref(), Some("No answer from B"));
        assert_eq!(f.media.live(), 0);
        assert!(f.factory.last().unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn toast_expires_from_snapshot() {
        let mut f = connected("A", "B", Config::default()).await;
        let mut rx = f.controller.subscribe();
        assert!(f.controller.snapshot().toast.is_some());
        f.controller.step().await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().toast.is_none());
    }

    #[tokio::test]
    async fn chat_requires_open_relay() {
        let mut f = fixture(Config::default());
        f.controller
            .handle_intent(Intent::SetLocalIdentity("A".into()))
            .await
            .unwrap();
        f.controller
            .handle_intent(Intent::SetRemoteIdentity("B".into()))
            .await
            .unwrap();
        let err = f
            .controller
            .handle_intent(Intent::SendChat("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RelayUnavailable));
        assert!(f.controller.snapshot().messages.is_empty());
    }
}
