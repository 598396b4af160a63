//! In-memory object store.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ObjectStore, StorageError, StorageObject, UploadBody, next_chunk};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// Object store kept entirely in process memory.
///
/// Keys are held in a sorted map so prefix listings come back in key order,
/// matching what S3 returns.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly, bypassing the upload path.
    pub async fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.insert_at(key, data, Utc::now()).await;
    }

    /// Insert an object with an explicit modification time.
    pub async fn insert_at(
        &self,
        key: impl Into<String>,
        data: impl Into<Vec<u8>>,
        last_modified: DateTime<Utc>,
    ) {
        let mut objects = self.objects.write().await;
        objects.insert(
            key.into(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    /// Get a copy of the object stored at `key`.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let objects = self.objects.read().await;
        objects.get(key).map(|o| o.data.clone())
    }

    /// All keys currently stored, in order.
    pub async fn keys(&self) -> Vec<String> {
        let objects = self.objects.read().await;
        objects.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| StorageObject {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects.read().await;
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let len = object.data.len();
        let start = usize::try_from(range.start).unwrap_or(usize::MAX).min(len);
        let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(object.data[start..end].to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.insert(key, data).await;
        Ok(())
    }

    async fn upload(&self, key: &str, mut body: UploadBody) -> Result<(), StorageError> {
        let mut data = Vec::new();
        while let Some(chunk) = next_chunk(&mut body, key).await? {
            data.extend_from_slice(&chunk);
        }
        self.insert(key, data).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::UploadChunk;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let store = MemoryStore::new();
        store.insert("alice/a", b"1".to_vec()).await;
        store.insert("alice/b/.dir", Vec::new()).await;
        store.insert("alice2/c", b"3".to_vec()).await;
        store.insert("bob/d", b"4".to_vec()).await;

        let keys: Vec<_> = store
            .list("alice/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["alice/a", "alice/b/.dir"]);
    }

    #[tokio::test]
    async fn test_get_range_clamps_to_object() {
        let store = MemoryStore::new();
        store.insert("k", b"hello".to_vec()).await;

        assert_eq!(store.get_range("k", 1..3).await.unwrap(), b"el");
        assert_eq!(store.get_range("k", 3..100).await.unwrap(), b"lo");
        assert!(store.get_range("k", 9..10).await.unwrap().is_empty());
        assert!(matches!(
            store.get_range("missing", 0..1).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_concatenates_chunks() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(4);
        let upload = store.upload("k", rx);
        let feed = async move {
            tx.send(UploadChunk::Data(b"he".to_vec())).await.unwrap();
            tx.send(UploadChunk::Data(b"llo".to_vec())).await.unwrap();
            tx.send(UploadChunk::Finish).await.unwrap();
        };
        let (result, ()) = tokio::join!(upload, feed);
        result.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_upload_without_finish_stores_nothing() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(4);
        let upload = store.upload("k", rx);
        let feed = async move {
            tx.send(UploadChunk::Data(b"partial".to_vec())).await.unwrap();
        };
        let (result, ()) = tokio::join!(upload, feed);
        assert!(matches!(result, Err(StorageError::UploadAborted { .. })));
        assert_eq!(store.get("k").await, None);
    }
}
