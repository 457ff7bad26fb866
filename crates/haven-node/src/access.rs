//! Peer access control.
//!
//! The node decides per request whether a peer may read a vault. The trust
//! graph that feeds real deployments plugs in behind [`AccessControl`];
//! authorization failures are reported as not-found so unauthorized peers
//! cannot probe for vault existence.

use std::collections::{HashMap, HashSet};

/// A peer identity as presented on the wire (the `x-haven-peer` header).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl PeerId {
    /// The anonymous peer, used when no identity header is present.
    pub fn anonymous() -> Self {
        Self(String::new())
    }
}

/// Decides whether a peer may fetch from a vault.
pub trait AccessControl: Send + Sync {
    fn can_access(&self, vault: &str, peer: &PeerId) -> bool;
}

/// Grants every peer access to every vault. Suitable for single-user
/// deployments behind an authenticated transport.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn can_access(&self, _vault: &str, _peer: &PeerId) -> bool {
        true
    }
}

/// Static per-vault allow lists, loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticAcl {
    grants: HashMap<String, HashSet<PeerId>>,
}

impl StaticAcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a peer access to a vault.
    pub fn allow(&mut self, vault: &str, peer: PeerId) {
        self.grants.entry(vault.to_string()).or_default().insert(peer);
    }
}

impl AccessControl for StaticAcl {
    fn can_access(&self, vault: &str, peer: &PeerId) -> bool {
        self.grants
            .get(vault)
            .is_some_and(|peers| peers.contains(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let acl = AllowAll;
        assert!(acl.can_access("any", &PeerId::anonymous()));
    }

    #[test]
    fn test_static_acl_scopes_by_vault() {
        let mut acl = StaticAcl::new();
        acl.allow("team-secrets", PeerId("alice".into()));

        assert!(acl.can_access("team-secrets", &PeerId("alice".into())));
        assert!(!acl.can_access("team-secrets", &PeerId("mallory".into())));
        assert!(!acl.can_access("other-vault", &PeerId("alice".into())));
        assert!(!acl.can_access("team-secrets", &PeerId::anonymous()));
    }
}
