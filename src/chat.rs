use serde::Serialize;

use crate::error::CallError;
use crate::presence::PresenceRegistry;
use crate::session::Identity;
use crate::signaling::SignalingMessage;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: Identity,
    pub text: String,
    /// Arrival/send order, strictly increasing.
    pub ordinal: u64,
    /// Authored locally (optimistic echo).
    pub local: bool,
}

/// Volatile chat history for the current relay connection.
#[derive(Debug, Default, Clone)]
pub struct ChatChannel {
    messages: Vec<ChatMessage>,
    next_ordinal: u64,
}

impl ChatChannel {
    /// Appends a locally-authored message and returns the `chat` frame to
    /// send to the selected peer.
    pub fn send(
        &mut self,
        presence: &PresenceRegistry,
        text: &str,
    ) -> Result<SignalingMessage, CallError> {
        let (from, to) = presence.require_ready()?;
        if text.trim().is_empty() {
            return Err(CallError::Validation("message is empty".into()));
        }
        self.append(from.clone(), text.to_string(), true);
        Ok(SignalingMessage::Chat {
            from,
            to,
            message: text.to_string(),
        })
    }

    pub fn receive(&mut self, from: Identity, text: String) {
        self.append(from, text, false);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn append(&mut self, from: Identity, text: String, local: bool) {
        self.next_ordinal += 1;
        self.messages.push(ChatMessage {
            from,
            text,
            ordinal: self.next_ordinal,
            local,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> PresenceRegistry {
        let mut p = PresenceRegistry::default();
        p.set_local("A".into());
        p.set_remote("B".into());
        p
    }

    #[test]
    fn send_echoes_locally_and_builds_frame() {
        let mut chat = ChatChannel::default();
        let frame = chat.send(&ready(), "hi").unwrap();
        assert_eq!(
            frame,
            SignalingMessage::Chat {
                from: "A".into(),
                to: "B".into(),
                message: "hi".into()
            }
        );
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.messages()[0].from.as_str(), "A");
        assert!(chat.messages()[0].local);
    }

    #[test]
    fn send_requires_both_identities() {
        let mut chat = ChatChannel::default();
        let err = chat.send(&PresenceRegistry::default(), "hi").unwrap_err();
        assert!(matches!(err, CallError::Validation(_)));
        assert!(chat.messages().is_empty());
    }

    #[test]
    fn ordinals_increase_across_directions() {
        let mut chat = ChatChannel::default();
        chat.receive("B".into(), "one".into());
        chat.send(&ready(), "two").unwrap();
        chat.receive("C".into(), "three".into());
        let ordinals: Vec<u64> = chat.messages().iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[test]
    fn blank_text_is_rejected() {
        let mut chat = ChatChannel::default();
        assert!(chat.send(&ready(), "   ").is_err());
        assert!(chat.messages().is_empty());
    }
}
