//! In-memory capabilities for driving the negotiator and state machine
//! without network or media.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::media::StaticTrackSource;
use super::transport::{
    MediaSource, MediaStream, MediaTrack, PeerTransport, PeerTransportFactory, TransportEvent,
};
use super::types::{IceCandidate, MediaConstraints, SessionDescription};
use crate::error::TransportError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What one mock transport saw.
#[derive(Debug)]
pub struct MockTransportState {
    pub seq: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    tracks: Mutex<Vec<String>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl MockTransportState {
    pub fn tracks(&self) -> Vec<String> {
        lock(&self.tracks).clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }

    /// Remote candidates applied, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.applied).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Injects a transport callback, e.g. a connection failure.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Default)]
struct FactoryInner {
    next_seq: AtomicUsize,
    transports: Mutex<Vec<Arc<MockTransportState>>>,
    candidates_per_description: AtomicUsize,
    reject_remote_description: AtomicBool,
}

/// Creates [`MockTransport`]s that trickle host candidates after the local
/// description is set and refuse candidates before a remote description.
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    inner: Arc<FactoryInner>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        let inner = FactoryInner::default();
        inner.candidates_per_description.store(2, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_local_candidates(self, n: usize) -> Self {
        self.inner.candidates_per_description.store(n, Ordering::SeqCst);
        self
    }

    /// Makes every later `set_remote_description` fail.
    pub fn reject_remote_descriptions(&self) {
        self.inner.reject_remote_description.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        lock(&self.inner.transports).len()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<MockTransportState>> {
        lock(&self.inner.transports).get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<MockTransportState>> {
        lock(&self.inner.transports).last().cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(MockTransportState {
            seq,
            events,
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        lock(&self.inner.transports).push(Arc::clone(&state));
        Ok(Box::new(MockTransport {
            state,
            factory: Arc::clone(&self.inner),
        }))
    }
}

pub struct MockTransport {
    state: Arc<MockTransportState>,
    factory: Arc<FactoryInner>,
}

impl MockTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.state.tracks).push(track.id.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.state.seq)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if lock(&self.state.remote).is_none() {
            return Err(TransportError::InvalidDescription(
                "answer requested without remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.state.seq)))
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        *lock(&self.state.local) = Some(desc.clone());
        let n = self.factory.candidates_per_description.load(Ordering::SeqCst);
        for i in 0..n {
            self.state.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{seq}{i} 1 udp 2122260223 10.0.{seq}.{i} 5000 typ host",
                seq = self.state.seq
            ))));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.factory.reject_remote_description.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidDescription("rejected by mock".into()));
        }
        *lock(&self.state.remote) = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if lock(&self.state.remote).is_none() {
            return Err(TransportError::ConnectionFailed(
                "candidate before remote description".into(),
            ));
        }
        lock(&self.state.applied).push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts acquisitions and releases; acquisition can be held open to
/// simulate a slow permission prompt.
#[derive(Debug, Default)]
pub struct MockMediaSource {
    acquired: AtomicUsize,
    released: AtomicUsize,
    held: AtomicBool,
    gate: Notify,
    fail: AtomicBool,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later acquisitions wait until [`MockMediaSource::resume`].
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub fn fail_acquisitions(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet released.
    pub fn live(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, TransportError> {
        while self.held.load(Ordering::SeqCst) {
            let notified = self.gate.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Media("permission denied".into()));
        }
        let stream = StaticTrackSource.acquire(constraints).await?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    fn release(&self, stream: MediaStream) {
        stream.stop();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Convenience for tests wanting shared handles of both mocks.
pub fn mock_capabilities() -> (MockTransportFactory, Arc<MockMediaSource>) {
    (MockTransportFactory::new(), Arc::new(MockMediaSource::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_never_underflows() {
        let media = MockMediaSource::new();
        let foreign = StaticTrackSource
            .acquire(MediaConstraints::default())
            .await
            .unwrap();
        media.release(foreign);
        assert_eq!(media.released(), 1);
        assert_eq!(media.live(), 0);

        let own = media.acquire(MediaConstraints::default()).await.unwrap();
        assert_eq!(media.live(), 0);
        media.release(own);
        assert_eq!(media.live(), 0);
    }
}
