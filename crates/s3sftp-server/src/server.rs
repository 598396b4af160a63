//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use s3sftp::Gateway;

use crate::ssh::SshHandler;

/// SFTP server configuration and runner.
pub struct SftpServer {
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    ssh_config: Arc<russh::server::Config>,
}

impl std::fmt::Debug for SftpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpServer")
            .field("addr", &self.addr)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl SftpServer {
    /// Create a server for `gateway` listening on `addr`.
    pub fn new(addr: SocketAddr, gateway: Arc<Gateway>, ssh_config: russh::server::Config) -> Self {
        Self {
            addr,
            gateway,
            ssh_config: Arc::new(ssh_config),
        }
    }

    /// Accept connections until a shutdown signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("Starting SFTP server on {}", self.addr);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    self.serve(socket, peer);
                }
                () = &mut shutdown => break,
            }
        }

        tracing::info!("SFTP server shut down");
        Ok(())
    }

    fn serve(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let handler = SshHandler::new(self.gateway.connect(Some(peer)));
        let config = Arc::clone(&self.ssh_config);
        tokio::spawn(async move {
            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "SSH handshake failed");
                    return;
                }
            };
            if let Err(e) = session.await {
                tracing::debug!(peer = %peer, error = %e, "SSH session ended with error");
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
