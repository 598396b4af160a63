//! s3sftp server
//!
//! Binds the s3sftp session engine to an SSH transport (russh) and the
//! SFTP v3 codec (russh-sftp). Users are loaded from a JSON file and each is
//! confined to its own prefix of the backing bucket.

pub mod config;
mod server;
mod sftp;
mod ssh;

pub use config::{ConfigError, UserEntry, UsersFile};
pub use server::SftpServer;
pub use sftp::SftpSession;
pub use ssh::{SshError, SshHandler, server_config};
