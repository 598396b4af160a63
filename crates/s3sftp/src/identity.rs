//! Registered identities and their namespace roots.

use ssh_key::PublicKey;
use thiserror::Error;

use crate::path::{Namespace, normalize_relative};

/// Errors that can occur while registering an identity
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The public key material could not be parsed
    #[error("invalid public key for {username}: {reason}")]
    InvalidKey {
        /// Username being registered
        username: String,
        /// Parser error
        reason: String,
    },
    /// The username normalizes to an empty path
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),
}

/// A user allowed to log in, with the key it must present and the storage
/// prefix it is confined to.
#[derive(Debug, Clone)]
pub struct Identity {
    username: String,
    key: PublicKey,
    key_algorithm: String,
    key_blob: Vec<u8>,
    namespace: Namespace,
}

impl Identity {
    /// Build an identity from a parsed key.
    ///
    /// The root is `namespace/username`, each part normalized independently.
    pub fn new(
        username: impl Into<String>,
        key: PublicKey,
        namespace: Option<&str>,
    ) -> Result<Self, RegistryError> {
        let username = username.into();
        let user_root = normalize_relative(&username);
        if user_root.is_empty() {
            return Err(RegistryError::InvalidUsername(username));
        }
        let root = match namespace.map(normalize_relative) {
            Some(ns) if !ns.is_empty() => format!("{ns}/{user_root}"),
            _ => user_root,
        };
        let key_blob = key.to_bytes().map_err(|e| RegistryError::InvalidKey {
            username: username.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            username,
            key_algorithm: key.algorithm().as_str().to_string(),
            key,
            key_blob,
            namespace: Namespace::new(root),
        })
    }

    /// Login name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Registered public key.
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Algorithm name of the registered key, e.g. `ssh-ed25519`.
    pub fn key_algorithm(&self) -> &str {
        &self.key_algorithm
    }

    /// SSH wire encoding of the registered key.
    pub fn key_blob(&self) -> &[u8] {
        &self.key_blob
    }

    /// Storage namespace the identity is confined to.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Root key of the namespace.
    pub fn root(&self) -> &str {
        self.namespace.root()
    }
}

/// Registered identities, searched in registration order.
///
/// Lookup is a linear scan and the first identity registered under a
/// username wins, so duplicate registrations never shadow earlier ones.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    identities: Vec<Identity>,
}

impl IdentityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key_material` (an OpenSSH `authorized_keys` line) and register it.
    pub fn register(
        &mut self,
        username: &str,
        key_material: &str,
        namespace: Option<&str>,
    ) -> Result<&Identity, RegistryError> {
        let key =
            PublicKey::from_openssh(key_material.trim()).map_err(|e| RegistryError::InvalidKey {
                username: username.to_string(),
                reason: e.to_string(),
            })?;
        Ok(self.insert(Identity::new(username, key, namespace)?))
    }

    /// Register an already-built identity.
    pub fn insert(&mut self, identity: Identity) -> &Identity {
        self.identities.push(identity);
        &self.identities[self.identities.len() - 1]
    }

    /// First identity registered under `username`.
    pub fn find(&self, username: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.username == username)
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const ALICE_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPGpiVk/7lj3dvIEVTyTODjblm1Q4wo2XjmSQlIKQLzs alice@example";
    pub(crate) const MALLORY_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDeBQfTOswOJgIzgV33R2LdJ61v+Z6QH1eRsWqXmzlfr mallory@example";

    #[test]
    fn test_register_computes_root() {
        let mut registry = IdentityRegistry::new();
        let alice = registry.register("alice", ALICE_KEY, None).unwrap();
        assert_eq!(alice.root(), "alice");
        assert_eq!(alice.key_algorithm(), "ssh-ed25519");

        let bob = registry
            .register("bob", MALLORY_KEY, Some("/tenants/acme/"))
            .unwrap();
        assert_eq!(bob.root(), "tenants/acme/bob");
    }

    #[test]
    fn test_register_normalizes_hostile_names() {
        let mut registry = IdentityRegistry::new();
        let identity = registry
            .register("../../alice", ALICE_KEY, Some("ns/../.."))
            .unwrap();
        assert_eq!(identity.root(), "alice");
        assert!(matches!(
            registry.register("/", ALICE_KEY, None),
            Err(RegistryError::InvalidUsername(_))
        ));
    }

    #[test]
    fn test_register_rejects_bad_key() {
        let mut registry = IdentityRegistry::new();
        let err = registry
            .register("alice", "ssh-ed25519 not-base64!!", None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidKey { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry = IdentityRegistry::new();
        registry.register("alice", ALICE_KEY, None).unwrap();
        registry.register("alice", MALLORY_KEY, Some("other")).unwrap();
        assert_eq!(registry.len(), 2);

        let found = registry.find("alice").unwrap();
        assert_eq!(found.root(), "alice");
        assert!(registry.find("carol").is_none());
    }
}
