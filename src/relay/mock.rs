//! In-memory relay for tests: records outbound frames and, when attached to
//! a [`MockRelayHub`], delivers them to the addressed client the way the
//! relay server does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RelayEvent, RelayPort};
use crate::error::RelayError;
use crate::session::Identity;
use crate::signaling::SignalingMessage;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes frames between mock relays by identity. `join` goes to everyone
/// else, other frames to their `to`.
#[derive(Clone, Default)]
pub struct MockRelayHub {
    clients: Arc<Mutex<HashMap<Identity, mpsc::UnboundedSender<RelayEvent>>>>,
}

impl MockRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay attached to this hub, delivering into `events`.
    pub fn relay(&self, events: mpsc::UnboundedSender<RelayEvent>) -> MockRelay {
        MockRelay {
            events,
            hub: Some(self.clone()),
            identity: Mutex::new(None),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn route(&self, from: &Identity, message: &SignalingMessage) {
        let clients = lock(&self.clients);
        match message {
            SignalingMessage::Join { .. } => {
                for (who, tx) in clients.iter() {
                    if who != from {
                        let _ = tx.send(RelayEvent::Message(message.clone()));
                    }
                }
            }
            _ => {
                if let Some(tx) = message.to().and_then(|to| clients.get(to)) {
                    let _ = tx.send(RelayEvent::Message(message.clone()));
                }
            }
        }
    }
}

pub struct MockRelay {
    events: mpsc::UnboundedSender<RelayEvent>,
    hub: Option<MockRelayHub>,
    identity: Mutex<Option<Identity>>,
    open: AtomicBool,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl MockRelay {
    /// A standalone relay that only records.
    pub fn new(events: mpsc::UnboundedSender<RelayEvent>) -> Self {
        Self {
            events,
            hub: None,
            identity: Mutex::new(None),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Everything sent so far, including the `join`.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        lock(&self.sent).clone()
    }

    pub fn take_sent(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// Deliver `message` as if it came from the relay.
    pub fn inject(&self, message: SignalingMessage) {
        let _ = self.events.send(RelayEvent::Message(message));
    }

    /// Simulate the socket dropping.
    pub fn drop_link(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(RelayEvent::Closed {
            reason: reason.to_owned(),
        });
    }
}

#[async_trait]
impl RelayPort for MockRelay {
    async fn connect(&self, identity: Identity) -> Result<(), RelayError> {
        if let Some(hub) = &self.hub {
            lock(&hub.clients).insert(identity.clone(), self.events.clone());
        }
        *lock(&self.identity) = Some(identity.clone());
        self.open.store(true, Ordering::SeqCst);
        self.send(&SignalingMessage::Join { username: identity })?;
        let _ = self.events.send(RelayEvent::Opened);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> Result<(), RelayError> {
        if !self.is_open() {
            return Err(RelayError::NotOpen);
        }
        lock(&self.sent).push(message.clone());
        if let (Some(hub), Some(me)) = (&self.hub, lock(&self.identity).as_ref()) {
            hub.route(me, message);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let (Some(hub), Some(me)) = (&self.hub, lock(&self.identity).take()) {
            lock(&hub.clients).remove(&me);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_routes_by_recipient_and_broadcasts_join() {
        let hub = MockRelayHub::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = hub.relay(a_tx);
        let b = hub.relay(b_tx);

        a.connect("A".into()).await.unwrap();
        assert_eq!(a_rx.recv().await, Some(RelayEvent::Opened));
        b.connect("B".into()).await.unwrap();
        assert_eq!(
            a_rx.recv().await,
            Some(RelayEvent::Message(SignalingMessage::Join {
                username: "B".into()
            }))
        );
        assert_eq!(b_rx.recv().await, Some(RelayEvent::Opened));

        let chat = SignalingMessage::Chat {
            from: "B".into(),
            to: "A".into(),
            message: "hello".into(),
        };
        b.send(&chat).unwrap();
        assert_eq!(a_rx.recv().await, Some(RelayEvent::Message(chat)));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_relay_refuses_send() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = MockRelay::new(tx);
        let msg = SignalingMessage::CallRejected {
            from: "A".into(),
            to: "B".into(),
        };
        assert!(matches!(relay.send(&msg), Err(RelayError::NotOpen)));
        relay.connect("A".into()).await.unwrap();
        relay.send(&msg).unwrap();
        assert_eq!(relay.sent().len(), 2);
    }
}
