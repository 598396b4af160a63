//! Per-session handle arena.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::attrs::NameEntry;
use crate::protocol::HandleId;
use crate::storage::{StorageError, UploadChunk};

/// An open file: the request path and the storage key it resolved to.
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub(crate) path: String,
    pub(crate) key: String,
    pub(crate) mode: FileMode,
}

#[derive(Debug)]
pub(crate) enum FileMode {
    Read {
        size: u64,
        completed: bool,
    },
    Write {
        stream: mpsc::Sender<UploadChunk>,
        upload: JoinHandle<Result<(), StorageError>>,
        next_offset: u64,
    },
}

/// An open directory listing, fixed at open time.
#[derive(Debug)]
pub(crate) struct DirectoryHandle {
    pub(crate) prefix: String,
    pub(crate) entries: Vec<NameEntry>,
    pub(crate) completed: bool,
}

#[derive(Debug)]
pub(crate) enum OpenHandle {
    File(FileHandle),
    Directory(DirectoryHandle),
}

/// Handle ids come from a strictly increasing counter and are never reused
/// within a session.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    next: u64,
    handles: HashMap<u32, OpenHandle>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `handle` under a fresh id, or give it back once the 32-bit id
    /// space is used up.
    pub(crate) fn insert(&mut self, handle: OpenHandle) -> Result<HandleId, OpenHandle> {
        let Ok(id) = u32::try_from(self.next) else {
            return Err(handle);
        };
        self.next += 1;
        self.handles.insert(id, handle);
        Ok(HandleId(id))
    }

    /// Whether every 32-bit id has been handed out.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.next > u64::from(u32::MAX)
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut OpenHandle> {
        self.handles.get_mut(&id.0)
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Option<OpenHandle> {
        self.handles.remove(&id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    #[cfg(test)]
    fn with_next(next: u64) -> Self {
        Self {
            next,
            handles: HashMap::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn directory() -> OpenHandle {
        OpenHandle::Directory(DirectoryHandle {
            prefix: "alice/".to_string(),
            entries: Vec::new(),
            completed: false,
        })
    }

    #[test]
    fn test_ids_increase_and_are_not_reused() {
        let mut table = HandleTable::new();
        let first = table.insert(directory()).unwrap();
        let second = table.insert(directory()).unwrap();
        assert_eq!(first, HandleId(0));
        assert_eq!(second, HandleId(1));

        assert!(table.remove(first).is_some());
        let third = table.insert(directory()).unwrap();
        assert_eq!(third, HandleId(2));
        assert_eq!(table.len(), 2);
        assert!(table.get_mut(first).is_none());
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut table = HandleTable::with_next(u64::from(u32::MAX));
        assert_eq!(table.insert(directory()).unwrap(), HandleId(u32::MAX));
        assert!(table.is_exhausted());
        assert!(table.insert(directory()).is_err());
        assert_eq!(table.len(), 1);
    }
}
