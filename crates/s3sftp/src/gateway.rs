//! Connection gateway: identity registration, authentication and session
//! creation.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::auth::{AuthDecision, AuthRequest};
use crate::callbacks::{Callbacks, Hooks};
use crate::identity::{Identity, IdentityRegistry, RegistryError};
use crate::session::{SessionConfig, SessionEngine};
use crate::storage::ObjectStore;

/// Shared entry point for every connection.
pub struct Gateway {
    registry: RwLock<IdentityRegistry>,
    store: Arc<dyn ObjectStore>,
    hooks: Hooks,
    session_config: SessionConfig,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("store", &self.store)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a gateway serving `store` with no identities and no hooks.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            registry: RwLock::new(IdentityRegistry::new()),
            store,
            hooks: Hooks::none(),
            session_config: SessionConfig::default(),
        }
    }

    /// Install audit callbacks.
    pub fn with_callbacks(mut self, callbacks: Arc<dyn Callbacks>) -> Self {
        self.hooks = Hooks::new(callbacks);
        self
    }

    /// Use `config` for every session created from now on.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Register an identity from an OpenSSH public key line.
    pub fn register(
        &self,
        username: &str,
        key_material: &str,
        namespace: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let identity = registry.register(username, key_material, namespace)?;
        tracing::info!(
            username = %identity.username(),
            root = %identity.root(),
            algorithm = %identity.key_algorithm(),
            "registered user"
        );
        drop(registry);
        self.hooks.add_user(username);
        Ok(())
    }

    /// Number of registered identities.
    pub fn user_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Decide an authentication attempt without tracking a connection.
    pub fn authenticate(&self, request: &AuthRequest) -> AuthDecision {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .authenticate(request)
    }

    /// Start tracking a new connection.
    pub fn connect(self: &Arc<Self>, peer: Option<SocketAddr>) -> Connection {
        tracing::debug!(peer = ?peer, "client connected");
        Connection {
            gateway: Arc::clone(self),
            peer,
            identity: None,
            established: false,
        }
    }
}

/// One client connection.
///
/// Dropping the connection fires `on_disconnect` and logs its end.
pub struct Connection {
    gateway: Arc<Gateway>,
    peer: Option<SocketAddr>,
    identity: Option<Identity>,
    established: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("username", &self.username())
            .field("established", &self.established)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Username once authentication has succeeded.
    pub fn username(&self) -> Option<&str> {
        self.identity.as_ref().map(Identity::username)
    }

    /// Run an authentication attempt, remembering the identity on success.
    pub fn authenticate(&mut self, request: &AuthRequest) -> AuthDecision {
        let decision = self.gateway.authenticate(request);
        match decision {
            AuthDecision::Accept(ref identity) => {
                tracing::info!(
                    peer = ?self.peer,
                    username = %identity.username(),
                    "authentication succeeded"
                );
                self.identity = Some(identity.clone());
            }
            AuthDecision::Reject(reason) => {
                tracing::info!(
                    peer = ?self.peer,
                    username = %request.username,
                    method = request.method.name(),
                    reason = %reason,
                    "authentication rejected"
                );
            }
            AuthDecision::KeyAcceptable(_) => {}
        }
        decision
    }

    /// Mark the authenticated connection ready and fire `on_login`.
    ///
    /// Does nothing before authentication or when called again.
    pub fn establish(&mut self) {
        if self.established {
            return;
        }
        let Some(ref identity) = self.identity else {
            return;
        };
        self.established = true;
        tracing::info!(peer = ?self.peer, username = %identity.username(), "client ready");
        self.gateway.hooks.login(identity.username());
    }

    /// Create the session engine for an SFTP subsystem request.
    ///
    /// Returns `None` when the connection has not authenticated.
    pub fn open_session(&self) -> Option<SessionEngine> {
        let identity = self.identity.clone()?;
        tracing::debug!(username = %identity.username(), root = %identity.root(), "starting SFTP session");
        Some(SessionEngine::new(
            identity,
            Arc::clone(&self.gateway.store),
            self.gateway.hooks.clone(),
            self.gateway.session_config.clone(),
        ))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::info!(peer = ?self.peer, username = ?self.username(), "Connection ended");
        self.gateway.hooks.disconnect(self.username());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, AuthRejected, KeyProof, PublicKeyOffer};
    use crate::callbacks::{CallbackResult, DisconnectEvent, UserEvent};
    use crate::identity::tests::ALICE_KEY;
    use crate::storage::MemoryStore;
    use ssh_key::PublicKey;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Callbacks for Recorder {
        fn on_add_user(&self, event: &UserEvent<'_>) -> CallbackResult {
            self.events.lock().unwrap().push(format!("add {}", event.username));
            Ok(())
        }

        fn on_login(&self, event: &UserEvent<'_>) -> CallbackResult {
            self.events.lock().unwrap().push(format!("login {}", event.username));
            Ok(())
        }

        fn on_disconnect(&self, event: &DisconnectEvent<'_>) -> CallbackResult {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnect {:?}", event.username));
            Ok(())
        }
    }

    fn gateway(recorder: &Arc<Recorder>) -> Arc<Gateway> {
        let gateway =
            Gateway::new(Arc::new(MemoryStore::new())).with_callbacks(recorder.clone());
        gateway.register("alice", ALICE_KEY, None).unwrap();
        Arc::new(gateway)
    }

    fn verified_request() -> AuthRequest {
        let key = PublicKey::from_openssh(ALICE_KEY).unwrap();
        AuthRequest {
            username: "alice".to_string(),
            method: AuthMethod::PublicKey(PublicKeyOffer {
                algorithm: "ssh-ed25519".to_string(),
                key: key.to_bytes().unwrap(),
                proof: KeyProof::VerifiedByTransport,
            }),
        }
    }

    #[test]
    fn test_connection_lifecycle_fires_hooks() {
        let recorder = Arc::new(Recorder::default());
        let gateway = gateway(&recorder);
        assert_eq!(gateway.user_count(), 1);

        let mut connection = gateway.connect(None);
        assert!(connection.open_session().is_none());

        assert!(matches!(
            connection.authenticate(&verified_request()),
            AuthDecision::Accept(_)
        ));
        connection.establish();
        connection.establish();
        let session = connection.open_session().unwrap();
        assert_eq!(session.identity().root(), "alice");
        drop(connection);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["add alice", "login alice", "disconnect Some(\"alice\")"]
        );
    }

    #[test]
    fn test_unauthenticated_disconnect() {
        let recorder = Arc::new(Recorder::default());
        let gateway = gateway(&recorder);

        let mut connection = gateway.connect(None);
        let request = AuthRequest {
            username: "alice".to_string(),
            method: AuthMethod::Password,
        };
        assert!(matches!(
            connection.authenticate(&request),
            AuthDecision::Reject(AuthRejected::UnsupportedMethod)
        ));
        connection.establish();
        drop(connection);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["add alice", "disconnect None"]
        );
    }

    #[test]
    fn test_register_invalid_key_fires_nothing() {
        let recorder = Arc::new(Recorder::default());
        let gateway = Gateway::new(Arc::new(MemoryStore::new())).with_callbacks(recorder.clone());
        assert!(gateway.register("bob", "garbage", None).is_err());
        assert!(recorder.events.lock().unwrap().is_empty());
    }
}
