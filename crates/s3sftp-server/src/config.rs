//! Users file loading.
//!
//! The users file is JSON:
//!
//! ```json
//! {
//!   "users": [
//!     { "username": "alice", "public_key": "ssh-ed25519 AAAA... alice@host" },
//!     { "username": "bob", "public_key": "ssh-ed25519 AAAA...", "namespace": "tenants/acme" }
//!   ],
//!   "session": { "upload_queue_depth": 32 }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use s3sftp::{Gateway, RegistryError, SessionConfig};

/// Errors that can occur while loading the users file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid JSON of the expected shape
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
    /// An entry could not be registered
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One user allowed to log in.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    /// Login name
    pub username: String,
    /// OpenSSH `authorized_keys` line
    pub public_key: String,
    /// Key prefix the user's root is placed under
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Contents of the users file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsersFile {
    /// Registered users, in registration order
    pub users: Vec<UserEntry>,
    /// Per-session tunables
    #[serde(default)]
    pub session: SessionConfig,
}

impl UsersFile {
    /// Read and parse the users file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Register every user with `gateway`.
    ///
    /// Entries without a namespace fall back to `default_namespace`.
    pub fn register_all(
        &self,
        gateway: &Gateway,
        default_namespace: Option<&str>,
    ) -> Result<(), ConfigError> {
        for user in &self.users {
            let namespace = user.namespace.as_deref().or(default_namespace);
            gateway.register(&user.username, &user.public_key, namespace)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use s3sftp::MemoryStore;

    const ALICE_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPGpiVk/7lj3dvIEVTyTODjblm1Q4wo2XjmSQlIKQLzs alice@example";

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_users_file() {
        let json = format!(
            r#"{{
                "users": [
                    {{ "username": "alice", "public_key": "{ALICE_KEY}" }},
                    {{ "username": "bob", "public_key": "{ALICE_KEY}", "namespace": "tenants" }}
                ],
                "session": {{ "upload_queue_depth": 4 }}
            }}"#
        );
        let file = write_file(&json);
        let users = UsersFile::load(file.path()).unwrap();

        assert_eq!(users.users.len(), 2);
        assert_eq!(users.users[0].namespace, None);
        assert_eq!(users.users[1].namespace.as_deref(), Some("tenants"));
        assert_eq!(users.session.upload_queue_depth, 4);

        let gateway = Gateway::new(Arc::new(MemoryStore::new()));
        users.register_all(&gateway, Some("default")).unwrap();
        assert_eq!(gateway.user_count(), 2);
    }

    #[test]
    fn test_session_section_is_optional() {
        let file = write_file(r#"{ "users": [] }"#);
        let users = UsersFile::load(file.path()).unwrap();
        assert!(users.users.is_empty());
        assert_eq!(
            users.session.upload_queue_depth,
            SessionConfig::default().upload_queue_depth
        );
    }

    #[test]
    fn test_load_errors() {
        let missing = UsersFile::load(Path::new("/nonexistent/users.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));

        let file = write_file("not json");
        let invalid = UsersFile::load(file.path()).unwrap_err();
        assert!(matches!(invalid, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_bad_key_fails_registration() {
        let file = write_file(r#"{ "users": [{ "username": "eve", "public_key": "nope" }] }"#);
        let users = UsersFile::load(file.path()).unwrap();
        let gateway = Gateway::new(Arc::new(MemoryStore::new()));
        let err = users.register_all(&gateway, None).unwrap_err();
        assert!(matches!(err, ConfigError::Registry(_)));
    }
}
