use std::collections::BTreeSet;

use crate::error::CallError;
use crate::session::Identity;

/// Local identity, selected remote identity and peers seen online.
#[derive(Debug, Default, Clone)]
pub struct PresenceRegistry {
    local: Identity,
    remote: Identity,
    online: BTreeSet<Identity>,
}

impl PresenceRegistry {
    pub fn set_local(&mut self, identity: Identity) {
        self.local = identity;
    }

    pub fn set_remote(&mut self, identity: Identity) {
        self.remote = identity;
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    pub fn is_ready(&self) -> bool {
        !self.local.is_empty() && !self.remote.is_empty()
    }

    /// Returns the `(local, remote)` pair, or the validation error every
    /// call-initiating operation reports when either side is unset.
    pub fn require_ready(&self) -> Result<(Identity, Identity), CallError> {
        if self.is_ready() {
            Ok((self.local.clone(), self.remote.clone()))
        } else {
            Err(CallError::identities_required())
        }
    }

    /// Records a peer announced by a relay `join`. Returns false for our own
    /// join echoed back or a peer already known.
    pub fn mark_online(&mut self, identity: Identity) -> bool {
        if identity.is_empty() || identity == self.local {
            return false;
        }
        self.online.insert(identity)
    }

    pub fn online(&self) -> impl Iterator<Item = &Identity> {
        self.online.iter()
    }

    /// Peers seen on a previous relay connection are not assumed online.
    pub fn clear_online(&mut self) {
        self.online.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_only_with_both_identities() {
        let mut p = PresenceRegistry::default();
        assert!(!p.is_ready());
        assert!(matches!(p.require_ready(), Err(CallError::Validation(_))));

        p.set_local("Suraj".into());
        assert!(!p.is_ready());

        p.set_remote("Monu".into());
        let (local, remote) = p.require_ready().unwrap();
        assert_eq!(local.as_str(), "Suraj");
        assert_eq!(remote.as_str(), "Monu");

        p.set_remote(Identity::new(""));
        assert!(!p.is_ready());
    }

    #[test]
    fn own_join_is_not_a_peer() {
        let mut p = PresenceRegistry::default();
        p.set_local("A".into());
        assert!(!p.mark_online("A".into()));
        assert!(p.mark_online("B".into()));
        assert!(!p.mark_online("B".into()));
        assert_eq!(p.online().count(), 1);
        p.clear_online();
        assert_eq!(p.online().count(), 0);
    }
}
