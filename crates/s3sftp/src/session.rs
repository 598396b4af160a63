//! Per-connection SFTP session engine.
//!
//! A [`SessionEngine`] serves one SFTP subsystem for one authenticated
//! identity. It owns the handle table, resolves client paths into the
//! identity's namespace and emulates directories over the flat key space with
//! `.dir` marker objects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::attrs::{EntryKind, FileAttrs, NameEntry, longname};
use crate::callbacks::{Hooks, ObjectEvent};
use crate::handle::{DirectoryHandle, FileHandle, FileMode, HandleTable, OpenHandle};
use crate::identity::Identity;
use crate::path::{DIR_MARKER, Namespace, basename, normalize};
use crate::protocol::{HandleId, OpenFlags, Request, Response, StatusCode};
use crate::storage::{ObjectStore, StorageError, StorageObject, UploadChunk};

const DEFAULT_UPLOAD_QUEUE_DEPTH: usize = 16;

/// Errors that can occur while serving a request
#[derive(Debug, Error)]
pub enum SessionError {
    /// No object or directory at the path
    #[error("no such file: {0}")]
    NotFound(String),
    /// The handle is unknown, malformed or of the wrong kind
    #[error("invalid handle")]
    InvalidHandle,
    /// The requested byte range cannot be served
    #[error("invalid read of {len} bytes at offset {offset} (size {size})")]
    InvalidRange {
        /// Requested offset
        offset: u64,
        /// Requested length after clamping
        len: u64,
        /// Object size
        size: u64,
    },
    /// The operation's precondition does not hold
    #[error("{0}")]
    PreconditionFailed(String),
    /// The object store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The open mode or operation is not supported
    #[error("operation not supported")]
    UnsupportedOperation,
    /// Every handle id of the session has been used
    #[error("handle space exhausted")]
    HandlesExhausted,
}

impl SessionError {
    /// Protocol status this error is reported as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::NotFound(_) => StatusCode::NoSuchFile,
            SessionError::UnsupportedOperation => StatusCode::OpUnsupported,
            _ => StatusCode::Failure,
        }
    }

    /// Message sent with the status; only precondition failures carry one.
    pub fn status_message(&self) -> String {
        match self {
            SessionError::PreconditionFailed(message) => message.clone(),
            _ => String::new(),
        }
    }
}

/// Tunables for a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Chunks a write stream buffers before WRITE waits for the upload
    pub upload_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            upload_queue_depth: DEFAULT_UPLOAD_QUEUE_DEPTH,
        }
    }
}

/// How a path resolved against the store.
struct Resolved {
    kind: EntryKind,
    size: u64,
    modified: DateTime<Utc>,
}

impl Resolved {
    fn attrs(&self) -> FileAttrs {
        match self.kind {
            EntryKind::File => FileAttrs::file(self.size, self.modified),
            EntryKind::Directory => FileAttrs::directory(self.modified),
        }
    }
}

/// Serves SFTP operations for one identity.
pub struct SessionEngine {
    identity: Identity,
    store: Arc<dyn ObjectStore>,
    hooks: Hooks,
    config: SessionConfig,
    handles: Mutex<HandleTable>,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("username", &self.identity.username())
            .field("root", &self.identity.root())
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Create an engine bound to `identity`.
    pub fn new(
        identity: Identity,
        store: Arc<dyn ObjectStore>,
        hooks: Hooks,
        config: SessionConfig,
    ) -> Self {
        Self {
            identity,
            store,
            hooks,
            config,
            handles: Mutex::new(HandleTable::new()),
        }
    }

    /// The identity this session serves.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn username(&self) -> &str {
        self.identity.username()
    }

    fn namespace(&self) -> &Namespace {
        self.identity.namespace()
    }

    /// Log a storage failure and fire `on_error`.
    fn storage_failure(&self, operation: &'static str, err: StorageError) -> SessionError {
        tracing::error!(
            username = %self.username(),
            operation,
            error = %err,
            "storage operation failed"
        );
        self.hooks
            .error(Some(self.username()), operation, &err.to_string());
        SessionError::Storage(err)
    }

    fn checked<T>(
        &self,
        operation: &'static str,
        result: Result<T, StorageError>,
    ) -> Result<T, SessionError> {
        result.map_err(|err| self.storage_failure(operation, err))
    }

    async fn allocate(&self, handle: OpenHandle) -> Result<HandleId, SessionError> {
        let mut handles = self.handles.lock().await;
        handles
            .insert(handle)
            .map_err(|_| SessionError::HandlesExhausted)
    }

    /// Open a file for reading or writing.
    ///
    /// Read mode requires an object at exactly the resolved key. Write mode
    /// starts a streamed upload that completes on [`close`](Self::close).
    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<HandleId, SessionError> {
        let path = path.strip_suffix(['/', '\\']).unwrap_or(path);
        let key = self.namespace().key(path);
        tracing::debug!(username = %self.username(), path = %path, key = %key, flags = flags.bits(), "OPEN");

        if flags.contains(OpenFlags::READ) {
            let objects = self.checked("OPEN", self.store.list(&key).await)?;
            let Some(object) = objects.into_iter().find(|o| o.key == key) else {
                tracing::debug!(key = %key, "no object at key");
                return Err(SessionError::NotFound(path.to_string()));
            };
            let handle = self
                .allocate(OpenHandle::File(FileHandle {
                    path: path.to_string(),
                    key,
                    mode: FileMode::Read {
                        size: object.size,
                        completed: false,
                    },
                }))
                .await?;
            tracing::debug!(handle = %handle, size = object.size, "opened for reading");
            Ok(handle)
        } else if flags.contains(OpenFlags::WRITE) {
            if normalize(path) == "/" {
                tracing::warn!(
                    username = %self.username(),
                    "refusing to write the namespace root"
                );
                return Err(SessionError::UnsupportedOperation);
            }
            self.open_write(path, key).await
        } else {
            Err(SessionError::UnsupportedOperation)
        }
    }

    async fn open_write(&self, path: &str, key: String) -> Result<HandleId, SessionError> {
        let mut handles = self.handles.lock().await;
        if handles.is_exhausted() {
            return Err(SessionError::HandlesExhausted);
        }

        let (stream, body) = mpsc::channel(self.config.upload_queue_depth.max(1));
        let store = Arc::clone(&self.store);
        let upload_key = key.clone();
        let upload = tokio::spawn(async move { store.upload(&upload_key, body).await });

        let handle = handles
            .insert(OpenHandle::File(FileHandle {
                path: path.to_string(),
                key,
                mode: FileMode::Write {
                    stream,
                    upload,
                    next_offset: 0,
                },
            }))
            .map_err(|_| SessionError::HandlesExhausted)?;
        tracing::debug!(handle = %handle, "opened for writing");
        Ok(handle)
    }

    /// Read up to `len` bytes at `offset`. `Ok(None)` means end of file.
    pub async fn read(
        &self,
        handle: &[u8],
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let id = HandleId::from_bytes(handle).ok_or(SessionError::InvalidHandle)?;

        let (path, key, len, size) = {
            let mut handles = self.handles.lock().await;
            let Some(OpenHandle::File(file)) = handles.get_mut(id) else {
                return Err(SessionError::InvalidHandle);
            };
            let FileMode::Read { size, completed } = file.mode else {
                return Err(SessionError::InvalidHandle);
            };
            if completed {
                tracing::debug!(handle = %id, "EOF");
                return Ok(None);
            }
            let len = u64::from(len).min(size.saturating_sub(offset));
            if offset >= size || len == 0 {
                return Err(SessionError::InvalidRange { offset, len, size });
            }
            (file.path.clone(), file.key.clone(), len, size)
        };

        let end = offset + len;
        tracing::debug!(handle = %id, key = %key, offset, len, "READ");
        let data = self.checked("READ", self.store.get_range(&key, offset..end).await)?;
        if data.is_empty() {
            return Err(self.storage_failure(
                "READ",
                StorageError::Backend(format!("empty range returned for {key}")),
            ));
        }

        if end >= size {
            let mut handles = self.handles.lock().await;
            if let Some(OpenHandle::File(FileHandle {
                mode: FileMode::Read { completed, .. },
                ..
            })) = handles.get_mut(id)
            {
                *completed = true;
            }
            drop(handles);
            tracing::debug!(handle = %id, key = %key, "download complete");
            self.hooks.get(ObjectEvent {
                username: self.username(),
                path: &path,
                key: &key,
            });
        }
        Ok(Some(data))
    }

    /// Append `data` to a write handle's upload.
    ///
    /// Data is streamed in arrival order; `offset` is only checked against the
    /// expected position.
    pub async fn write(&self, handle: &[u8], offset: u64, data: Vec<u8>) -> Result<(), SessionError> {
        let id = HandleId::from_bytes(handle).ok_or(SessionError::InvalidHandle)?;

        let (key, stream) = {
            let mut handles = self.handles.lock().await;
            let Some(OpenHandle::File(file)) = handles.get_mut(id) else {
                return Err(SessionError::InvalidHandle);
            };
            let FileMode::Write {
                ref stream,
                ref mut next_offset,
                ..
            } = file.mode
            else {
                return Err(SessionError::InvalidHandle);
            };
            if offset != *next_offset {
                tracing::warn!(
                    handle = %id,
                    key = %file.key,
                    offset,
                    expected = *next_offset,
                    "non-sequential write, appending"
                );
            }
            *next_offset += data.len() as u64;
            (file.key.clone(), stream.clone())
        };

        tracing::debug!(handle = %id, offset, len = data.len(), "WRITE");
        stream.send(UploadChunk::Data(data)).await.map_err(|_| {
            self.storage_failure(
                "WRITE",
                StorageError::UploadAborted {
                    key,
                    reason: "upload stream closed".to_string(),
                },
            )
        })
    }

    /// Release a handle. For write handles this finishes the upload and
    /// resolves only once the object is durable.
    pub async fn close(&self, handle: &[u8]) -> Result<(), SessionError> {
        let id = HandleId::from_bytes(handle).ok_or(SessionError::InvalidHandle)?;
        let Some(open) = self.handles.lock().await.remove(id) else {
            tracing::info!(handle = %id, "close of unknown handle");
            return Err(SessionError::InvalidHandle);
        };

        let file = match open {
            OpenHandle::File(file) => file,
            OpenHandle::Directory(dir) => {
                tracing::debug!(handle = %id, prefix = %dir.prefix, "closed directory");
                return Ok(());
            }
        };

        let FileMode::Write { stream, upload, .. } = file.mode else {
            tracing::debug!(handle = %id, key = %file.key, "closed download");
            return Ok(());
        };

        // A failed send means the upload already stopped; its result says why.
        if stream.send(UploadChunk::Finish).await.is_err() {
            tracing::debug!(handle = %id, key = %file.key, "upload stopped before finish");
        }
        drop(stream);
        tracing::debug!(handle = %id, key = %file.key, "stream finished, awaiting upload");
        let result = match upload.await {
            Ok(result) => result,
            Err(join_err) => Err(StorageError::UploadAborted {
                key: file.key.clone(),
                reason: join_err.to_string(),
            }),
        };
        self.checked("CLOSE", result)?;

        tracing::info!(username = %self.username(), key = %file.key, "upload complete");
        self.hooks.put(ObjectEvent {
            username: self.username(),
            path: &file.path,
            key: &file.key,
        });
        Ok(())
    }

    /// Snapshot the immediate children of a directory.
    pub async fn open_dir(&self, path: &str) -> Result<HandleId, SessionError> {
        let prefix = self.namespace().dir_prefix(path);
        tracing::debug!(username = %self.username(), path = %path, prefix = %prefix, "OPENDIR");

        let objects = self.checked("OPENDIR", self.store.list(&prefix).await)?;
        if objects.is_empty() && normalize(path) != "/" {
            return Err(SessionError::NotFound(path.to_string()));
        }

        let now = Utc::now();
        let entries: Vec<NameEntry> = objects
            .iter()
            .filter_map(|object| self.child_entry(&prefix, object, now))
            .collect();
        tracing::debug!(listed = objects.len(), children = entries.len(), "directory snapshot");

        self.allocate(OpenHandle::Directory(DirectoryHandle {
            prefix,
            entries,
            completed: false,
        }))
        .await
    }

    /// Map a listed object to an entry of the directory at `prefix`, if it is
    /// an immediate child.
    fn child_entry(
        &self,
        prefix: &str,
        object: &StorageObject,
        now: DateTime<Utc>,
    ) -> Option<NameEntry> {
        let relative = object.key.strip_prefix(prefix)?;
        let (name, kind) = match relative.split_once('/') {
            None if relative.is_empty() || relative == DIR_MARKER => return None,
            None => (relative, EntryKind::File),
            Some((segment, DIR_MARKER)) if !segment.is_empty() => (segment, EntryKind::Directory),
            Some(_) => return None,
        };
        let resolved = Resolved {
            kind,
            size: object.size,
            modified: object.last_modified,
        };
        Some(NameEntry {
            filename: name.to_string(),
            longname: longname(kind, object.size, object.last_modified, self.username(), name, now),
            attrs: resolved.attrs(),
        })
    }

    /// Return the whole directory snapshot once; `Ok(None)` afterwards.
    pub async fn read_dir(&self, handle: &[u8]) -> Result<Option<Vec<NameEntry>>, SessionError> {
        let id = HandleId::from_bytes(handle).ok_or(SessionError::InvalidHandle)?;
        let mut handles = self.handles.lock().await;
        let Some(OpenHandle::Directory(dir)) = handles.get_mut(id) else {
            return Err(SessionError::InvalidHandle);
        };
        if dir.completed {
            tracing::debug!(handle = %id, "EOF");
            return Ok(None);
        }
        dir.completed = true;
        let entries = std::mem::take(&mut dir.entries);
        tracing::debug!(handle = %id, count = entries.len(), "READDIR");
        Ok(Some(entries))
    }

    /// Find the object or directory marker a path names.
    async fn resolve(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<Option<Resolved>, SessionError> {
        let key = self.namespace().key(path);
        let marker = self.namespace().marker_key(path);
        let objects = self.checked(operation, self.store.list(&key).await)?;

        let found = objects
            .into_iter()
            .find(|o| o.key == key || o.key == marker)
            .map(|o| Resolved {
                kind: if o.key == marker {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: o.size,
                modified: o.last_modified,
            });

        Ok(found.or_else(|| {
            (normalize(path) == "/").then(|| Resolved {
                kind: EntryKind::Directory,
                size: 0,
                modified: Utc::now(),
            })
        }))
    }

    /// Canonicalize a path, confirming something exists there.
    pub async fn real_path(&self, path: &str) -> Result<NameEntry, SessionError> {
        let requested = if path == "." { "/" } else { path };
        let canonical = normalize(requested);
        tracing::debug!(username = %self.username(), path = %path, canonical = %canonical, "REALPATH");

        let Some(resolved) = self.resolve("REALPATH", &canonical).await? else {
            return Err(SessionError::NotFound(path.to_string()));
        };
        Ok(NameEntry {
            longname: longname(
                resolved.kind,
                resolved.size,
                resolved.modified,
                self.username(),
                basename(&canonical),
                Utc::now(),
            ),
            attrs: resolved.attrs(),
            filename: canonical,
        })
    }

    /// Attributes of the file or directory at `path`.
    pub async fn stat(&self, path: &str) -> Result<FileAttrs, SessionError> {
        self.stat_as("STAT", path).await
    }

    /// Same as [`stat`](Self::stat); the store has no symbolic links.
    pub async fn lstat(&self, path: &str) -> Result<FileAttrs, SessionError> {
        self.stat_as("LSTAT", path).await
    }

    async fn stat_as(&self, operation: &'static str, path: &str) -> Result<FileAttrs, SessionError> {
        tracing::debug!(username = %self.username(), path = %path, operation, "stat");
        match self.resolve(operation, path).await? {
            Some(resolved) => Ok(resolved.attrs()),
            None => Err(SessionError::NotFound(path.to_string())),
        }
    }

    /// Create a directory by writing its marker. Existing markers are
    /// overwritten.
    pub async fn make_dir(&self, path: &str) -> Result<(), SessionError> {
        let marker = self.namespace().marker_key(path);
        tracing::debug!(username = %self.username(), path = %path, key = %marker, "MKDIR");
        self.checked("MKDIR", self.store.put(&marker, Vec::new()).await)?;
        self.hooks.mkdir(ObjectEvent {
            username: self.username(),
            path,
            key: &marker,
        });
        Ok(())
    }

    /// Remove an empty directory's marker.
    pub async fn remove_dir(&self, path: &str) -> Result<(), SessionError> {
        let prefix = self.namespace().dir_prefix(path);
        let marker = self.namespace().marker_key(path);
        tracing::debug!(username = %self.username(), path = %path, prefix = %prefix, "RMDIR");

        let objects = self.checked("RMDIR", self.store.list(&prefix).await)?;
        if objects.is_empty() {
            return Err(SessionError::NotFound(path.to_string()));
        }
        if objects.iter().any(|o| o.key != marker) {
            tracing::debug!(path = %path, count = objects.len(), "directory not empty");
            return Err(SessionError::PreconditionFailed(
                "Directory not empty".to_string(),
            ));
        }

        self.checked("RMDIR", self.store.delete(&marker).await)?;
        self.hooks.rmdir(ObjectEvent {
            username: self.username(),
            path,
            key: &marker,
        });
        Ok(())
    }

    /// Serve one decoded request. The response always echoes the request id.
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id();
        let operation = request.name();

        let result = match request {
            Request::Open { path, flags, .. } => self
                .open(&path, flags)
                .await
                .map(|handle| Response::Handle {
                    id,
                    handle: handle.to_bytes().to_vec(),
                }),
            Request::Read {
                handle,
                offset,
                len,
                ..
            } => self.read(&handle, offset, len).await.map(|data| match data {
                Some(data) => Response::Data { id, data },
                None => Response::status(id, StatusCode::Eof, ""),
            }),
            Request::Write {
                handle,
                offset,
                data,
                ..
            } => self
                .write(&handle, offset, data)
                .await
                .map(|()| Response::status(id, StatusCode::Ok, "")),
            Request::OpenDir { path, .. } => {
                self.open_dir(&path).await.map(|handle| Response::Handle {
                    id,
                    handle: handle.to_bytes().to_vec(),
                })
            }
            Request::ReadDir { handle, .. } => {
                self.read_dir(&handle).await.map(|entries| match entries {
                    Some(entries) => Response::Name { id, entries },
                    None => Response::status(id, StatusCode::Eof, ""),
                })
            }
            Request::RealPath { path, .. } => self.real_path(&path).await.map(|entry| {
                Response::Name {
                    id,
                    entries: vec![entry],
                }
            }),
            Request::Close { handle, .. } => self
                .close(&handle)
                .await
                .map(|()| Response::status(id, StatusCode::Ok, "")),
            Request::RmDir { path, .. } => self
                .remove_dir(&path)
                .await
                .map(|()| Response::status(id, StatusCode::Ok, "")),
            Request::MkDir { path, .. } => self
                .make_dir(&path)
                .await
                .map(|()| Response::status(id, StatusCode::Ok, "")),
            Request::Stat { path, .. } => self
                .stat(&path)
                .await
                .map(|attrs| Response::Attrs { id, attrs }),
            Request::LStat { path, .. } => self
                .lstat(&path)
                .await
                .map(|attrs| Response::Attrs { id, attrs }),
        };

        result.unwrap_or_else(|err| {
            tracing::debug!(
                username = %self.username(),
                operation,
                error = %err,
                "request failed"
            );
            Response::status(id, err.status_code(), err.status_message())
        })
    }
}
