//! Call lifecycle as a synchronous state machine.
//!
//! Every handler mutates the machine and returns the side effects the
//! controller must perform, in order. Nothing here awaits, so races are
//! reproduced in tests by feeding events in the order of interest.

use tracing::{debug, info, warn};

use crate::chat::{ChatChannel, ChatMessage};
use crate::error::CallError;
use crate::peer::negotiator::NegotiatorEvent;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::presence::PresenceRegistry;
use crate::relay::RelayEvent;
use crate::session::{CallSession, Identity, Phase, RemoteTrack, Role, SessionId};
use crate::signaling::SignalingMessage;

/// Negotiation step requested from the session negotiator.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiateOp {
    CreateOutbound,
    CreateInboundAnswer(SessionDescription),
    ApplyRemoteAnswer(SessionDescription),
    ApplyCandidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(SignalingMessage),
    Negotiate { session: SessionId, op: NegotiateOp },
    CloseNegotiator(SessionId),
    ArmRingTimer(SessionId),
    Notice(String),
}

#[derive(Debug, Default)]
pub struct CallStateMachine {
    presence: PresenceRegistry,
    chat: ChatChannel,
    session: Option<CallSession>,
    /// Phase reported while no session exists: `Idle` or `Failed`.
    resting: Phase,
    relay_open: bool,
    send_hangup: bool,
}

impl CallStateMachine {
    pub fn new(send_hangup: bool) -> Self {
        Self {
            send_hangup,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.session.as_ref().map_or(self.resting, |s| s.phase)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.chat.messages()
    }

    pub fn relay_open(&self) -> bool {
        self.relay_open
    }

    /// Caller of the call currently ringing, if any.
    pub fn incoming(&self) -> Option<&Identity> {
        self.session
            .as_ref()
            .filter(|s| s.phase == Phase::Ringing)
            .map(|s| &s.remote)
    }

    pub fn set_local_identity(&mut self, identity: Identity) {
        self.presence.set_local(identity);
    }

    pub fn set_remote_identity(&mut self, identity: Identity) {
        self.presence.set_remote(identity);
    }

    /// Place an outbound call to `remote`, or to the selected peer.
    pub fn start_call(&mut self, remote: Option<Identity>) -> Result<Vec<Command>, CallError> {
        let local = self.presence.local().clone();
        let remote = remote
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.presence.remote().clone());
        if local.is_empty() || remote.is_empty() {
            return Err(CallError::identities_required());
        }
        if local == remote {
            return Err(CallError::Validation("You cannot call yourself.".into()));
        }
        if !self.phase().is_resting() {
            return Err(CallError::Busy(self.phase()));
        }
        if !self.relay_open {
            return Err(CallError::RelayUnavailable);
        }

        self.presence.set_remote(remote.clone());
        let session = CallSession::outgoing(local, remote.clone());
        let id = session.id.clone();
        info!(session = %id, to = %remote, "starting call");
        self.session = Some(session);
        Ok(vec![
            Command::Negotiate {
                session: id.clone(),
                op: NegotiateOp::CreateOutbound,
            },
            Command::ArmRingTimer(id),
            Command::Notice(format!("Calling {remote}...")),
        ])
    }

    pub fn accept(&mut self) -> Result<Vec<Command>, CallError> {
        let phase = self.phase();
        let Some(session) = self.session.as_mut().filter(|s| s.phase == Phase::Ringing) else {
            return Err(CallError::InvalidPhase { op: "accept", phase });
        };
        if !self.relay_open {
            return Err(CallError::RelayUnavailable);
        }
        let Some(offer) = session.remote_description.clone() else {
            return Err(CallError::InvalidPhase { op: "accept", phase });
        };
        session.phase = Phase::Active;
        let id = session.id.clone();
        let caller = session.remote.clone();
        info!(session = %id, from = %caller, "accepting call");
        self.presence.set_remote(caller.clone());
        Ok(vec![
            Command::Negotiate {
                session: id,
                op: NegotiateOp::CreateInboundAnswer(offer),
            },
            Command::Notice(format!("In call with {caller}")),
        ])
    }

    pub fn reject(&mut self) -> Result<Vec<Command>, CallError> {
        let phase = self.phase();
        if phase != Phase::Ringing {
            return Err(CallError::InvalidPhase { op: "reject", phase });
        }
        let mut commands = self.decline();
        commands.push(Command::Notice("Call declined".into()));
        Ok(commands)
    }

    /// End the current call. While ringing this declines it.
    pub fn hangup(&mut self) -> Result<Vec<Command>, CallError> {
        match self.phase() {
            Phase::Ringing => self.reject(),
            Phase::Calling | Phase::Active => {
                let Some(session) = self.end(Phase::Idle) else {
                    return Ok(Vec::new());
                };
                info!(session = %session.id, "hanging up");
                let mut commands = vec![Command::CloseNegotiator(session.id)];
                if self.send_hangup {
                    commands.push(Command::Send(SignalingMessage::HangUp {
                        from: session.local,
                        to: session.remote,
                    }));
                }
                commands.push(Command::Notice("Call ended".into()));
                Ok(commands)
            }
            phase => Err(CallError::InvalidPhase { op: "hangup", phase }),
        }
    }

    pub fn send_chat(&mut self, text: &str) -> Result<Vec<Command>, CallError> {
        if !self.relay_open && self.presence.is_ready() {
            return Err(CallError::RelayUnavailable);
        }
        let frame = self.chat.send(&self.presence, text)?;
        Ok(vec![Command::Send(frame)])
    }

    pub fn handle_relay(&mut self, event: RelayEvent) -> Vec<Command> {
        match event {
            RelayEvent::Opened => {
                self.relay_open = true;
                vec![Command::Notice(format!("{} is online", self.presence.local()))]
            }
            RelayEvent::Closed { reason } => {
                let was_open = std::mem::replace(&mut self.relay_open, false);
                self.presence.clear_online();
                if let Some(session) = self.end(Phase::Failed) {
                    warn!(session = %session.id, "relay lost during call: {reason}");
                    return vec![
                        Command::CloseNegotiator(session.id),
                        Command::Notice("Disconnected from signaling server, call ended".into()),
                    ];
                }
                if was_open {
                    vec![Command::Notice("Disconnected from signaling server".into())]
                } else {
                    Vec::new()
                }
            }
            RelayEvent::Message(msg) => self.handle_message(msg),
        }
    }

    pub fn handle_message(&mut self, msg: SignalingMessage) -> Vec<Command> {
        if let SignalingMessage::Join { username } = &msg {
            if self.presence.mark_online(username.clone()) {
                return vec![Command::Notice(format!("{username} is online"))];
            }
            return Vec::new();
        }

        let local = self.presence.local();
        if local.is_empty() || msg.to() != Some(local) {
            debug!(kind = msg.kind(), to = ?msg.to(), "dropping frame addressed elsewhere");
            return Vec::new();
        }

        match msg {
            SignalingMessage::Chat { from, message, .. } => {
                self.chat.receive(from, message);
                Vec::new()
            }
            SignalingMessage::Offer { from, offer, .. } => self.on_offer(from, offer),
            SignalingMessage::Answer { from, answer, .. } => self.on_answer(from, answer),
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => match self.counterpart_session(&from) {
                Some(session) => vec![Command::Negotiate {
                    session: session.id.clone(),
                    op: NegotiateOp::ApplyCandidate(candidate),
                }],
                None => {
                    debug!(from = %from, "dropping candidate without matching session");
                    Vec::new()
                }
            },
            SignalingMessage::CallRejected { from, .. } => {
                self.remote_teardown(&from, format!("{from} rejected the call"))
            }
            SignalingMessage::HangUp { from, .. } => {
                self.remote_teardown(&from, format!("{from} ended the call"))
            }
            SignalingMessage::Join { .. } => Vec::new(),
        }
    }

    pub fn handle_negotiator(&mut self, event: NegotiatorEvent) -> Vec<Command> {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| &s.id == event.session())
        else {
            debug!(session = %event.session(), "dropping negotiator event for closed session");
            return Vec::new();
        };

        match event {
            NegotiatorEvent::LocalDescription { description, .. } => {
                session.local_description = Some(description.clone());
                let from = session.local.clone();
                let to = session.remote.clone();
                let first = match session.role {
                    Role::Caller => SignalingMessage::Offer {
                        from: from.clone(),
                        to: to.clone(),
                        offer: description,
                    },
                    Role::Callee => SignalingMessage::Answer {
                        from: from.clone(),
                        to: to.clone(),
                        answer: description,
                    },
                };
                let mut commands = vec![Command::Send(first)];
                commands.extend(session.pending_local_candidates.drain(..).map(|candidate| {
                    Command::Send(SignalingMessage::IceCandidate {
                        from: from.clone(),
                        to: to.clone(),
                        candidate,
                    })
                }));
                commands
            }
            NegotiatorEvent::LocalCandidate { candidate, .. } => {
                if session.local_description.is_none() {
                    session.pending_local_candidates.push_back(candidate);
                    return Vec::new();
                }
                vec![Command::Send(SignalingMessage::IceCandidate {
                    from: session.local.clone(),
                    to: session.remote.clone(),
                    candidate,
                })]
            }
            NegotiatorEvent::RemoteTrack { id, kind, .. } => {
                session.remote_tracks.push(RemoteTrack { id, kind });
                Vec::new()
            }
            NegotiatorEvent::Connected { .. } => {
                session.media_connected = true;
                vec![Command::Notice(format!("Connected to {}", session.remote))]
            }
            NegotiatorEvent::Disconnected { .. } => {
                let remote = session.remote.clone();
                let Some(session) = self.end(Phase::Idle) else {
                    return Vec::new();
                };
                vec![
                    Command::CloseNegotiator(session.id),
                    Command::Notice(format!("{remote} ended the call")),
                ]
            }
            NegotiatorEvent::Failed { reason, .. } => {
                let Some(session) = self.end(Phase::Failed) else {
                    return Vec::new();
                };
                warn!(session = %session.id, "call failed: {reason}");
                vec![
                    Command::CloseNegotiator(session.id),
                    Command::Notice(format!("Call failed: {reason}")),
                ]
            }
        }
    }

    /// The ring timer armed for `id` expired.
    pub fn ring_timeout(&mut self, id: &SessionId) -> Vec<Command> {
        let Some(session) = self.session.as_ref().filter(|s| &s.id == id) else {
            return Vec::new();
        };
        match session.phase {
            Phase::Calling => {
                let remote = session.remote.clone();
                let Some(session) = self.end(Phase::Idle) else {
                    return Vec::new();
                };
                info!(session = %session.id, "no answer");
                vec![
                    Command::CloseNegotiator(session.id),
                    Command::Notice(format!("No answer from {remote}")),
                ]
            }
            Phase::Ringing => {
                let caller = session.remote.clone();
                let mut commands = self.decline();
                commands.push(Command::Notice(format!("Missed call from {caller}")));
                commands
            }
            _ => Vec::new(),
        }
    }

    fn on_offer(&mut self, from: Identity, offer: SessionDescription) -> Vec<Command> {
        let local = self.presence.local().clone();
        if !self.phase().is_resting() {
            info!(from = %from, phase = ?self.phase(), "busy, rejecting offer");
            return vec![Command::Send(SignalingMessage::CallRejected { from: local, to: from })];
        }
        let session = CallSession::incoming(local, from.clone(), offer);
        let id = session.id.clone();
        info!(session = %id, from = %from, "incoming call");
        self.session = Some(session);
        vec![
            Command::ArmRingTimer(id),
            Command::Notice(format!("Incoming call from {from}")),
        ]
    }

    fn on_answer(&mut self, from: Identity, answer: SessionDescription) -> Vec<Command> {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.phase == Phase::Calling && s.is_counterpart(&from))
        else {
            debug!(from = %from, "ignoring unexpected answer");
            return Vec::new();
        };
        session.phase = Phase::Active;
        session.remote_description = Some(answer.clone());
        info!(session = %session.id, "call answered");
        vec![
            Command::Negotiate {
                session: session.id.clone(),
                op: NegotiateOp::ApplyRemoteAnswer(answer),
            },
            Command::Notice(format!("In call with {from}")),
        ]
    }

    fn remote_teardown(&mut self, from: &Identity, notice: String) -> Vec<Command> {
        if self.counterpart_session(from).is_none() {
            debug!(from = %from, "ignoring teardown from non-counterpart");
            return Vec::new();
        }
        let Some(session) = self.end(Phase::Idle) else {
            return Vec::new();
        };
        vec![Command::CloseNegotiator(session.id), Command::Notice(notice)]
    }

    /// Send `call-rejected` for the ringing session and drop it.
    fn decline(&mut self) -> Vec<Command> {
        let Some(session) = self.end(Phase::Idle) else {
            return Vec::new();
        };
        info!(session = %session.id, to = %session.remote, "declining call");
        vec![
            Command::Send(SignalingMessage::CallRejected {
                from: session.local,
                to: session.remote,
            }),
            Command::CloseNegotiator(session.id),
        ]
    }

    fn counterpart_session(&self, from: &Identity) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.is_counterpart(from))
    }

    fn end(&mut self, resting: Phase) -> Option<CallSession> {
        let session = self.session.take()?;
        self.resting = resting;
        info!(
            session = %session.id,
            phase = ?session.phase,
            elapsed_ms = session.elapsed().num_milliseconds(),
            "session ended"
        );
        Some(session)
    }
}
