//! s3sftp server binary
//!
//! Serves SFTP over SSH with an S3 bucket (or an in-memory store) as the
//! backing storage.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use s3sftp::storage::{S3Config, S3Store};
use s3sftp::{Gateway, MemoryStore, ObjectStore};
use s3sftp_server::{SftpServer, UsersFile, server_config};

/// s3sftp server - SFTP over a flat object store
#[derive(Parser, Debug)]
#[command(name = "s3sftp-server")]
#[command(about = "SFTP server backed by an S3 bucket")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:2222")]
    addr: SocketAddr,

    /// Bucket holding every user's namespace
    #[arg(long, required_unless_present = "memory")]
    bucket: Option<String>,

    /// AWS region (defaults to the provider chain)
    #[arg(long)]
    region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[arg(long)]
    endpoint_url: Option<String>,

    /// Path to the SSH host private key
    #[arg(long)]
    host_key: PathBuf,

    /// Path to the users JSON file
    #[arg(long)]
    users: PathBuf,

    /// Namespace for users that do not declare one
    #[arg(long)]
    namespace: Option<String>,

    /// Disconnect idle clients after this many seconds
    #[arg(long, default_value_t = 3600)]
    inactivity_timeout_secs: u64,

    /// Multipart upload part size in bytes
    #[arg(long)]
    upload_part_size: Option<usize>,

    /// Serve from an in-memory store instead of S3
    #[arg(long)]
    memory: bool,
}

async fn build_store(args: &Args) -> anyhow::Result<Arc<dyn ObjectStore>> {
    if args.memory {
        tracing::warn!("serving from an in-memory store, data is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let bucket = args.bucket.clone().context("--bucket is required")?;
    let mut config = S3Config::new(bucket);
    if let Some(ref region) = args.region {
        config = config.with_region(region);
    }
    if let Some(ref endpoint_url) = args.endpoint_url {
        config = config.with_endpoint_url(endpoint_url);
    }
    if let Some(part_size) = args.upload_part_size {
        config = config.with_part_size(part_size);
    }
    tracing::info!(bucket = %config.bucket, part_size = config.part_size, "using S3 store");
    Ok(Arc::new(S3Store::from_env(config).await))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let users = UsersFile::load(&args.users)?;
    let store = build_store(&args).await?;
    let gateway = Gateway::new(store).with_session_config(users.session.clone());
    users.register_all(&gateway, args.namespace.as_deref())?;
    tracing::info!(users = gateway.user_count(), "loaded users");

    let ssh_config = server_config(
        &args.host_key,
        Duration::from_secs(args.inactivity_timeout_secs),
    )
    .with_context(|| format!("loading host key {}", args.host_key.display()))?;

    let server = SftpServer::new(args.addr, Arc::new(gateway), ssh_config);
    server.run().await?;

    Ok(())
}
