//! Drives one peer transport through description and candidate exchange.
//!
//! Each session gets a worker task that executes negotiation steps strictly
//! in submission order. Closing cancels the worker: an outstanding step
//! (media acquisition, offer creation, ...) is abandoned and its result
//! discarded, then the transport is closed and local media released.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ice::{log_candidate_summary, CandidateQueue};
use super::transport::{MediaSource, MediaStream, PeerTransport, PeerTransportFactory, TransportEvent};
use super::types::{IceCandidate, MediaConstraints, SessionDescription, TrackKind};
use crate::error::NegotiationError;
use crate::logger::dump_candidate;
use crate::session::{CallSession, Role, SessionId};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Results of negotiation work, tagged with the session they belong to.
#[derive(Debug, Clone)]
pub enum NegotiatorEvent {
    LocalDescription {
        session: SessionId,
        description: SessionDescription,
    },
    LocalCandidate {
        session: SessionId,
        candidate: IceCandidate,
    },
    RemoteTrack {
        session: SessionId,
        id: String,
        kind: TrackKind,
    },
    Connected {
        session: SessionId,
    },
    /// The peer connection went away without failing, typically because
    /// the counterpart closed its side.
    Disconnected {
        session: SessionId,
    },
    Failed {
        session: SessionId,
        reason: String,
    },
}

impl NegotiatorEvent {
    pub fn session(&self) -> &SessionId {
        match self {
            NegotiatorEvent::LocalDescription { session, .. }
            | NegotiatorEvent::LocalCandidate { session, .. }
            | NegotiatorEvent::RemoteTrack { session, .. }
            | NegotiatorEvent::Connected { session }
            | NegotiatorEvent::Disconnected { session }
            | NegotiatorEvent::Failed { session, .. } => session,
        }
    }
}

/// Progress of the current negotiation, as last published by its worker.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NegotiationStatus {
    pub transport_ready: bool,
    pub local_description_set: bool,
    pub remote_description_set: bool,
    pub pending_remote_candidates: usize,
    pub applied_remote_candidates: usize,
    pub closed: bool,
}

#[derive(Debug)]
enum Op {
    Outbound,
    InboundAnswer(SessionDescription),
    RemoteAnswer(SessionDescription),
    Candidate(IceCandidate),
}

struct Negotiation {
    session: SessionId,
    started: bool,
    ops: mpsc::UnboundedSender<Op>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: Arc<Mutex<NegotiationStatus>>,
}

pub struct SessionNegotiator {
    factory: Arc<dyn PeerTransportFactory>,
    media: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    current: Option<Negotiation>,
}

impl SessionNegotiator {
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        media: Arc<dyn MediaSource>,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        Self {
            factory,
            media,
            constraints: MediaConstraints::default(),
            events,
            current: None,
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Acquire media, build the transport and produce the local offer.
    /// The offer arrives as [`NegotiatorEvent::LocalDescription`].
    pub fn create_outbound(&mut self, session: &CallSession) -> Result<(), NegotiationError> {
        if session.role != Role::Caller {
            return Err(NegotiationError::ProtocolOrder("outbound offer on callee session"));
        }
        self.start(session, Op::Outbound)
    }

    /// Acquire media, build the transport, apply `offer` and produce the
    /// local answer. Candidates queued so far are replayed right after the
    /// offer is set.
    pub fn create_inbound_answer(
        &mut self,
        session: &CallSession,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if session.role != Role::Callee {
            return Err(NegotiationError::ProtocolOrder("inbound answer on caller session"));
        }
        self.start(session, Op::InboundAnswer(offer))
    }

    /// Set the callee's answer as remote description. Duplicate or
    /// premature answers are logged and ignored by the worker.
    pub fn apply_remote_answer(
        &mut self,
        session: &CallSession,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if session.role != Role::Caller {
            return Err(NegotiationError::ProtocolOrder("answer on callee session"));
        }
        match self.current.as_ref() {
            Some(n) if n.session == session.id && n.started => {
                let _ = n.ops.send(Op::RemoteAnswer(answer));
                Ok(())
            }
            _ => Err(NegotiationError::ProtocolOrder("answer before local offer")),
        }
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// is set.
    pub fn enqueue_or_apply_candidate(&mut self, session: &CallSession, candidate: IceCandidate) {
        let negotiation = self.negotiation(session);
        let _ = negotiation.ops.send(Op::Candidate(candidate));
    }

    /// Release everything held for `session`. No-op when nothing is open.
    pub async fn close(&mut self, session: &SessionId) {
        let Some(negotiation) = self.current.take() else {
            return;
        };
        if &negotiation.session != session {
            self.current = Some(negotiation);
            return;
        }
        debug!(session = %session, "closing negotiation");
        let Negotiation {
            ops, cancel, task, ..
        } = negotiation;
        cancel.cancel();
        drop(ops);
        match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %session, "negotiation worker ended abnormally: {e}"),
            Err(_) => warn!(session = %session, "negotiation close timed out; finishing in background"),
        }
    }

    pub fn is_open(&self, session: &SessionId) -> bool {
        self.current.as_ref().is_some_and(|n| &n.session == session)
    }

    pub fn status(&self) -> Option<NegotiationStatus> {
        self.current
            .as_ref()
            .map(|n| n.status.lock().map(|s| s.clone()).unwrap_or_default())
    }

    fn start(&mut self, session: &CallSession, op: Op) -> Result<(), NegotiationError> {
        let negotiation = self.negotiation(session);
        if negotiation.started {
            return Err(NegotiationError::AlreadyStarted(session.id.to_string()));
        }
        negotiation.started = true;
        let _ = negotiation.ops.send(op);
        Ok(())
    }

    fn negotiation(&mut self, session: &CallSession) -> &mut Negotiation {
        let negotiation = match self.current.take() {
            Some(n) if n.session == session.id => n,
            Some(old) => {
                warn!(old = %old.session, new = %session.id, "replacing unclosed negotiation");
                old.cancel.cancel();
                self.spawn(session)
            }
            None => self.spawn(session),
        };
        self.current.insert(negotiation)
    }

    fn spawn(&self, session: &CallSession) -> Negotiation {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let status = Arc::new(Mutex::new(NegotiationStatus::default()));
        let worker = Worker {
            session: session.id.clone(),
            role: session.role,
            factory: Arc::clone(&self.factory),
            media: Arc::clone(&self.media),
            constraints: self.constraints,
            events: self.events.clone(),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            transport: None,
            transport_events: None,
            stream: None,
            local_set: false,
            remote_set: false,
            pending: CandidateQueue::default(),
            applied: 0,
            gathered: Vec::new(),
        };
        Negotiation {
            session: session.id.clone(),
            started: false,
            ops: ops_tx,
            cancel,
            task: tokio::spawn(worker.run(ops_rx)),
            status,
        }
    }
}

/// Await `fut` unless the negotiation is closed first.
async fn cancellable<T, E>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, NegotiationError>
where
    E: Into<NegotiationError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Worker {
    session: SessionId,
    role: Role,
    factory: Arc<dyn PeerTransportFactory>,
    media: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    status: Arc<Mutex<NegotiationStatus>>,
    cancel: CancellationToken,
    transport: Option<Box<dyn PeerTransport>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    stream: Option<MediaStream>,
    local_set: bool,
    remote_set: bool,
    pending: CandidateQueue,
    applied: usize,
    gathered: Vec<IceCandidate>,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ev = next_event(&mut self.transport_events) => match ev {
                    Some(ev) => {
                        if !self.forward(ev) {
                            break;
                        }
                    }
                    None => self.transport_events = None,
                },
                op = ops.recv() => {
                    let Some(op) = op else { break };
                    match self.step(op).await {
                        Ok(()) => {}
                        Err(NegotiationError::Cancelled) => break,
                        Err(NegotiationError::ProtocolOrder(what)) => {
                            warn!(session = %self.session, "ignoring out-of-order step: {what}");
                        }
                        Err(err) => {
                            self.emit(NegotiatorEvent::Failed {
                                session: self.session.clone(),
                                reason: err.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            self.publish();
        }
        self.teardown().await;
    }

    async fn step(&mut self, op: Op) -> Result<(), NegotiationError> {
        match op {
            Op::Outbound => {
                self.prepare().await?;
                let transport = self.transport()?;
                let offer = cancellable(&self.cancel, transport.create_offer()).await?;
                cancellable(&self.cancel, transport.set_local_description(&offer)).await?;
                self.local_set = true;
                self.emit(NegotiatorEvent::LocalDescription {
                    session: self.session.clone(),
                    description: offer,
                });
            }
            Op::InboundAnswer(offer) => {
                self.prepare().await?;
                cancellable(&self.cancel, self.transport()?.set_remote_description(&offer))
                    .await?;
                self.remote_set = true;
                self.flush_pending().await?;
                let transport = self.transport()?;
                let answer = cancellable(&self.cancel, transport.create_answer()).await?;
                cancellable(&self.cancel, transport.set_local_description(&answer)).await?;
                self.local_set = true;
                self.emit(NegotiatorEvent::LocalDescription {
                    session: self.session.clone(),
                    description: answer,
                });
            }
            Op::RemoteAnswer(answer) => {
                if self.role != Role::Caller {
                    return Err(NegotiationError::ProtocolOrder("answer on callee session"));
                }
                if !self.local_set {
                    return Err(NegotiationError::ProtocolOrder("answer before local offer"));
                }
                if self.remote_set {
                    return Err(NegotiationError::ProtocolOrder("duplicate answer"));
                }
                cancellable(&self.cancel, self.transport()?.set_remote_description(&answer))
                    .await?;
                self.remote_set = true;
                self.flush_pending().await?;
            }
            Op::Candidate(candidate) => {
                if self.remote_set && self.transport.is_some() {
                    self.apply(candidate).await?;
                } else {
                    debug!(session = %self.session, "remote description not set yet, queuing candidate");
                    self.pending.push(candidate);
                }
            }
        }
        Ok(())
    }

    /// Acquire local media, create the transport and attach the tracks.
    async fn prepare(&mut self) -> Result<(), NegotiationError> {
        let stream = cancellable(&self.cancel, self.media.acquire(self.constraints)).await?;
        self.stream = Some(stream);

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = cancellable(&self.cancel, self.factory.create(tx)).await?;
        self.transport = Some(transport);
        self.transport_events = Some(rx);

        if let (Some(stream), Some(transport)) = (self.stream.as_ref(), self.transport.as_deref()) {
            for track in &stream.tracks {
                cancellable(&self.cancel, transport.add_track(track)).await?;
            }
        }
        self.publish();
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), NegotiationError> {
        let queued: Vec<IceCandidate> = self.pending.drain().collect();
        if !queued.is_empty() {
            debug!(session = %self.session, count = queued.len(), "applying queued candidates");
        }
        for candidate in queued {
            self.apply(candidate).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        dump_candidate("REMOTE", &candidate);
        let result =
            cancellable(&self.cancel, self.transport()?.add_ice_candidate(&candidate)).await;
        match result {
            Ok(()) => {
                self.applied += 1;
                Ok(())
            }
            Err(NegotiationError::Cancelled) => Err(NegotiationError::Cancelled),
            Err(e) => {
                // A single unusable candidate does not fail the call.
                warn!(session = %self.session, "failed to add ICE candidate: {e}");
                Ok(())
            }
        }
    }

    /// Forward a transport callback. Returns false when the session failed.
    fn forward(&mut self, event: TransportEvent) -> bool {
        let session = self.session.clone();
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", &candidate);
                self.gathered.push(candidate.clone());
                self.emit(NegotiatorEvent::LocalCandidate { session, candidate });
            }
            TransportEvent::RemoteTrack { id, kind } => {
                info!(session = %session, track = %id, ?kind, "remote track");
                self.emit(NegotiatorEvent::RemoteTrack { session, id, kind });
            }
            TransportEvent::Connected => self.emit(NegotiatorEvent::Connected { session }),
            TransportEvent::Disconnected => {
                info!(session = %session, "peer connection closed");
                self.emit(NegotiatorEvent::Disconnected { session });
                return false;
            }
            TransportEvent::Failed(reason) => {
                self.emit(NegotiatorEvent::Failed { session, reason });
                return false;
            }
        }
        true
    }

    fn transport(&self) -> Result<&dyn PeerTransport, NegotiationError> {
        self.transport
            .as_deref()
            .ok_or(NegotiationError::ProtocolOrder("no transport yet"))
    }

    fn emit(&self, event: NegotiatorEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        if let Ok(mut status) = self.status.lock() {
            *status = NegotiationStatus {
                transport_ready: self.transport.is_some(),
                local_description_set: self.local_set,
                remote_description_set: self.remote_set,
                pending_remote_candidates: self.pending.len(),
                applied_remote_candidates: self.applied,
                closed: false,
            };
        }
    }

    async fn teardown(mut self) {
        self.pending.clear();
        self.transport_events = None;
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(session = %self.session, "closing transport failed: {e}");
            }
        }
        if let Some(stream) = self.stream.take() {
            self.media.release(stream);
        }
        log_candidate_summary(&self.session.to_string(), &self.gathered);
        if let Ok(mut status) = self.status.lock() {
            status.pending_remote_candidates = 0;
            status.transport_ready = false;
            status.closed = true;
        }
        debug!(session = %self.session, "negotiation released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{MockMediaSource, MockTransportFactory};
    use crate::session::Identity;

    struct Harness {
        factory: MockTransportFactory,
        media: Arc<MockMediaSource>,
        negotiator: SessionNegotiator,
        events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    }

    fn harness() -> Harness {
        let factory = MockTransportFactory::new().with_local_candidates(0);
        let media = Arc::new(MockMediaSource::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let negotiator = SessionNegotiator::new(Arc::new(factory.clone()), media.clone(), tx);
        Harness {
            factory,
            media,
            negotiator,
            events: rx,
        }
    }

    fn caller_session() -> CallSession {
        CallSession::outgoing(Identity::new("A"), Identity::new("B"))
    }

    fn callee_session() -> CallSession {
        CallSession::incoming(
            Identity::new("B"),
            Identity::new("A"),
            SessionDescription::offer("remote-offer"),
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn next_description(events: &mut mpsc::UnboundedReceiver<NegotiatorEvent>) -> SessionDescription {
        loop {
            match events.recv().await.expect("event stream ended") {
                NegotiatorEvent::LocalDescription { description, .. } => return description,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn outbound_produces_offer_with_tracks_attached() {
        let mut h = harness();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();

        let offer = next_description(&mut h.events).await;
        assert_eq!(offer, SessionDescription::offer("mock-offer-1"));
        let transport = h.factory.last().unwrap();
        assert_eq!(transport.tracks().len(), 2);
        assert_eq!(transport.local_description(), Some(offer));
        assert_eq!(h.media.acquired(), 1);
    }

    #[tokio::test]
    async fn outbound_twice_is_rejected() {
        let mut h = harness();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();
        let err = h.negotiator.create_outbound(&session).unwrap_err();
        assert!(matches!(err, NegotiationError::AlreadyStarted(_)));
    }

    #[tokio::test]
    async fn candidates_before_answer_replay_in_arrival_order() {
        let mut h = harness();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();
        next_description(&mut h.events).await;

        let sent: Vec<IceCandidate> = (0..5)
            .map(|i| IceCandidate::new(format!("candidate:{i} 1 udp 1 10.1.0.{i} 6000 typ host")))
            .collect();
        for c in &sent {
            h.negotiator.enqueue_or_apply_candidate(&session, c.clone());
        }
        wait_until(|| {
            h.negotiator
                .status()
                .is_some_and(|s| s.pending_remote_candidates == 5)
        })
        .await;
        let transport = h.factory.last().unwrap();
        assert!(transport.applied_candidates().is_empty());

        h.negotiator
            .apply_remote_answer(&session, SessionDescription::answer("remote-answer"))
            .unwrap();
        wait_until(|| transport.applied_candidates().len() == 5).await;
        assert_eq!(transport.applied_candidates(), sent);

        // later candidates go straight through, no duplicates
        let late = IceCandidate::new("candidate:9 1 udp 1 10.1.0.9 6000 typ host");
        h.negotiator.enqueue_or_apply_candidate(&session, late.clone());
        wait_until(|| transport.applied_candidates().len() == 6).await;
        assert_eq!(transport.applied_candidates().last(), Some(&late));
        let status = h.negotiator.status().unwrap();
        assert_eq!(status.pending_remote_candidates, 0);
        assert_eq!(status.applied_remote_candidates, 6);
    }

    #[tokio::test]
    async fn candidates_while_ringing_replay_after_offer() {
        let mut h = harness();
        let session = callee_session();
        let early = IceCandidate::new("candidate:1 1 udp 1 10.2.0.1 7000 typ host");
        h.negotiator.enqueue_or_apply_candidate(&session, early.clone());
        wait_until(|| {
            h.negotiator
                .status()
                .is_some_and(|s| s.pending_remote_candidates == 1)
        })
        .await;
        assert_eq!(h.factory.created(), 0);

        h.negotiator
            .create_inbound_answer(&session, SessionDescription::offer("remote-offer"))
            .unwrap();
        let answer = next_description(&mut h.events).await;
        assert_eq!(answer, SessionDescription::answer("mock-answer-1"));

        let transport = h.factory.last().unwrap();
        assert_eq!(transport.remote_description(), Some(SessionDescription::offer("remote-offer")));
        assert_eq!(transport.applied_candidates(), vec![early]);
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let mut h = harness();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();
        next_description(&mut h.events).await;

        h.negotiator
            .apply_remote_answer(&session, SessionDescription::answer("first"))
            .unwrap();
        h.negotiator
            .apply_remote_answer(&session, SessionDescription::answer("second"))
            .unwrap();
        let transport = h.factory.last().unwrap();
        wait_until(|| transport.remote_description().is_some()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            transport.remote_description(),
            Some(SessionDescription::answer("first"))
        );
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn answer_before_offer_is_protocol_error() {
        let mut h = harness();
        let session = caller_session();
        let err = h
            .negotiator
            .apply_remote_answer(&session, SessionDescription::answer("early"))
            .unwrap_err();
        assert!(matches!(err, NegotiationError::ProtocolOrder(_)));
        assert_eq!(h.factory.created(), 0);
    }

    #[tokio::test]
    async fn close_releases_transport_and_media() {
        let mut h = harness();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();
        next_description(&mut h.events).await;

        h.negotiator.close(&session.id).await;
        let transport = h.factory.last().unwrap();
        assert!(transport.is_closed());
        assert_eq!(h.media.live(), 0);
        assert!(h.negotiator.status().is_none());

        // idempotent
        h.negotiator.close(&session.id).await;
        h.negotiator.close(&SessionId::generate()).await;
    }

    #[tokio::test]
    async fn close_during_media_acquisition_discards_step() {
        let mut h = harness();
        h.media.hold();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        h.negotiator.close(&session.id).await;
        h.media.resume();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(h.factory.created(), 0);
        assert_eq!(h.media.live(), 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_transport_reports_disconnect() {
        let mut h = harness();
        let session = caller_session();
        h.negotiator.create_outbound(&session).unwrap();
        wait_until(|| h.factory.created() == 1).await;

        let transport = h.factory.last().unwrap();
        transport.emit(TransportEvent::Disconnected);
        let disconnected = loop {
            match h.events.recv().await.unwrap() {
                NegotiatorEvent::Disconnected { session } => break session,
                _ => continue,
            }
        };
        assert_eq!(disconnected, session.id);

        h.negotiator.close(&session.id).await;
        assert!(transport.is_closed());
        assert_eq!(h.media.live(), 0);
    }

    #[tokio::test]
    async fn transport_failure_reports_and_releases() {
        let mut h = harness();
        h.factory.reject_remote_descriptions();
        let session = callee_session();
        h.negotiator
            .create_inbound_answer(&session, SessionDescription::offer("bad"))
            .unwrap();

        let failed = loop {
            match h.events.recv().await.unwrap() {
                NegotiatorEvent::Failed { reason, .. } => break reason,
                _ => continue,
            }
        };
        assert!(failed.contains("rejected by mock"));
        let transport = h.factory.last().unwrap();
        wait_until(|| transport.is_closed()).await;
        wait_until(|| h.media.live() == 0).await;
    }
}
