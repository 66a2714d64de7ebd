//! Entry points for the presentation layer.
//!
//! The UI forwards user actions as [`Intent`]s and renders [`Snapshot`]s.
//! All intents are processed by the controller task in arrival order.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::call::controller::{CallController, Request};
use crate::call::Snapshot;
use crate::error::CallError;
use crate::session::Identity;

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Open the relay link for the local identity.
    Connect,
    SetLocalIdentity(Identity),
    SetRemoteIdentity(Identity),
    /// Call the given peer, or the selected remote identity.
    StartCall(Option<Identity>),
    AcceptCall,
    RejectCall,
    Hangup,
    SendChat(String),
    DismissError,
}

/// Handle to a running controller task.
pub struct ClientHandle {
    requests: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<Snapshot>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Spawn `controller` on the current runtime.
    pub fn spawn(controller: CallController) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let snapshot = controller.subscribe();
        let task = tokio::spawn(controller.run(rx));
        Self {
            requests,
            snapshot,
            task,
        }
    }

    /// Queue an intent without waiting for its outcome.
    pub fn send(&self, intent: Intent) {
        if self
            .requests
            .send(Request {
                intent,
                reply: None,
            })
            .is_err()
        {
            warn!("controller stopped, intent dropped");
        }
    }

    /// Queue an intent and wait until it has been applied.
    pub async fn request(&self, intent: Intent) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request {
                intent,
                reply: Some(tx),
            })
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Wait for the next snapshot satisfying `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        let mut rx = self.snapshot.clone();
        let found = rx.wait_for(pred).await.map(|snap| snap.clone());
        found.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Hang up, close the negotiator and the relay, and stop the task.
    pub async fn shutdown(self) {
        let Self { requests, task, .. } = self;
        drop(requests);
        if let Err(e) = task.await {
            warn!("controller task ended abnormally: {e}");
        }
    }

    pub async fn connect(&self, local: impl Into<Identity>) -> Result<(), CallError> {
        self.request(Intent::SetLocalIdentity(local.into())).await?;
        self.request(Intent::Connect).await
    }

    pub async fn start_call(&self, remote: impl Into<Identity>) -> Result<(), CallError> {
        self.request(Intent::StartCall(Some(remote.into()))).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Intent::AcceptCall).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Intent::RejectCall).await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(Intent::Hangup).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), CallError> {
        self.request(Intent::SendChat(text.into())).await
    }
}
