//! SSH transport binding.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet};
use russh_keys::PublicKeyBase64;
use russh_keys::key;
use thiserror::Error;

use s3sftp::{
    AuthDecision, AuthMethod, AuthRejected, AuthRequest, Connection, KeyProof, PublicKeyOffer,
};

use crate::sftp::SftpSession;

/// Errors surfaced by the SSH handler
#[derive(Debug, Error)]
pub enum SshError {
    /// Transport error
    #[error(transparent)]
    Russh(#[from] russh::Error),
    /// Host key could not be loaded
    #[error("failed to load host key: {0}")]
    HostKey(#[from] russh_keys::Error),
}

/// Build the SSH server configuration.
///
/// Only public-key authentication is advertised.
pub fn server_config(
    host_key: &Path,
    inactivity_timeout: Duration,
) -> Result<russh::server::Config, SshError> {
    let key_pair = russh_keys::load_secret_key(host_key, None)?;
    Ok(russh::server::Config {
        inactivity_timeout: Some(inactivity_timeout),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::PUBLICKEY,
        keys: vec![key_pair],
        ..Default::default()
    })
}

/// Per-connection SSH handler.
pub struct SshHandler {
    connection: Connection,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl std::fmt::Debug for SshHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshHandler")
            .field("connection", &self.connection)
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl SshHandler {
    /// Handler for a freshly accepted connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            channels: HashMap::new(),
        }
    }

    fn decide(&mut self, request: AuthRequest) -> Auth {
        match self.connection.authenticate(&request) {
            AuthDecision::Accept(_) | AuthDecision::KeyAcceptable(_) => Auth::Accept,
            AuthDecision::Reject(reason) => reject(reason),
        }
    }
}

fn reject(reason: AuthRejected) -> Auth {
    Auth::Reject {
        proceed_with_methods: reason
            .advertises_public_key()
            .then_some(MethodSet::PUBLICKEY),
    }
}

fn public_key_request(user: &str, public_key: &key::PublicKey, proof: KeyProof) -> AuthRequest {
    let key = public_key.public_key_bytes();
    let algorithm = ssh_key::PublicKey::from_bytes(&key)
        .map(|parsed| parsed.algorithm().as_str().to_string())
        .unwrap_or_else(|_| public_key.name().to_string());
    AuthRequest {
        username: user.to_string(),
        method: AuthMethod::PublicKey(PublicKeyOffer {
            algorithm,
            key,
            proof,
        }),
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = SshError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.decide(AuthRequest {
            username: user.to_string(),
            method: AuthMethod::None,
        }))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.decide(AuthRequest {
            username: user.to_string(),
            method: AuthMethod::Password,
        }))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.decide(public_key_request(user, public_key, KeyProof::Query)))
    }

    // Called once russh has verified the client's signature.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.decide(public_key_request(
            user,
            public_key,
            KeyProof::VerifiedByTransport,
        )))
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        self.connection.establish();
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            tracing::warn!(subsystem = %name, "unsupported subsystem");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let engine = self.connection.open_session();
        let (Some(channel), Some(engine)) = (self.channels.remove(&channel_id), engine) else {
            tracing::warn!(channel = ?channel_id, "sftp requested without an open session");
            session.channel_failure(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);
        tracing::info!(username = %engine.identity().username(), "SFTP session started");
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(engine)).await;
        Ok(())
    }
}

