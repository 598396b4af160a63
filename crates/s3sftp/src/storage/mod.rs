//! Object store adapters.
//!
//! This module provides:
//! - `ObjectStore` - The flat, prefix-queryable storage interface the session engine drives
//! - `MemoryStore` - In-process implementation for tests and local runs
//! - `S3Store` - AWS S3 implementation (behind the `s3` feature)

mod memory;
#[cfg(feature = "s3")]
mod s3;

use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::{MIN_PART_SIZE, S3Config, S3Store};

/// One message on a streamed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadChunk {
    /// Bytes to append, in arrival order
    Data(Vec<u8>),
    /// End of input; the object may be committed
    Finish,
}

/// Body of a streamed upload.
///
/// A body whose sender goes away before [`UploadChunk::Finish`] arrives is
/// abandoned and must not be committed.
pub type UploadBody = mpsc::Receiver<UploadChunk>;

/// Receive the next data chunk of `body`.
///
/// Returns `Ok(None)` on [`UploadChunk::Finish`] and
/// [`StorageError::UploadAborted`] if the sender was dropped first.
pub async fn next_chunk(
    body: &mut UploadBody,
    key: &str,
) -> Result<Option<Vec<u8>>, StorageError> {
    match body.recv().await {
        Some(UploadChunk::Data(data)) => Ok(Some(data)),
        Some(UploadChunk::Finish) => Ok(None),
        None => Err(StorageError::UploadAborted {
            key: key.to_string(),
            reason: "upload stream ended without finish".to_string(),
        }),
    }
}

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object exists at the key
    #[error("object not found: {0}")]
    NotFound(String),
    /// The backend rejected or failed the request
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A streamed upload could not be completed
    #[error("upload of {key} aborted: {reason}")]
    UploadAborted {
        /// Key being uploaded
        key: String,
        /// Why the upload stopped
        reason: String,
    },
}

/// An object as reported by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    /// Full storage key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
}

/// Flat key-value object storage with prefix listing.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// List every object whose key starts with `prefix`, across all result pages.
    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError>;

    /// Fetch the bytes of `key` within `range` (end-exclusive).
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>, StorageError>;

    /// Store `data` at `key` in a single request.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Store the concatenation of every chunk received on `body` at `key`.
    ///
    /// Resolves once [`UploadChunk::Finish`] has been received and the object
    /// is durable. An abandoned body leaves no object behind.
    async fn upload(&self, key: &str, body: UploadBody) -> Result<(), StorageError>;

    /// Delete the object at `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
