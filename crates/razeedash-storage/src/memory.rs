//! In-memory object store for testing.
//!
//! Buckets and objects live in `BTreeMap`s behind a `RwLock`. Nothing is
//! persisted. Clones share state, so several "replicas" in a test can point at
//! the same store and observe each other's buckets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::{CreateBucketRequest, ObjectStore, StorageError};

type Buckets = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// An in-memory object store.
///
/// Records every bucket creation request that reaches it, which lets tests
/// assert how many creations a provisioning race actually produced.
///
/// # Examples
///
/// ```
/// # use razeedash_storage::{CreateBucketRequest, MemoryObjectStore, ObjectStore};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryObjectStore::new();
/// store.create_bucket(&CreateBucketRequest { bucket: "b1".into(), ..Default::default() }).await.unwrap();
/// store.put_object("b1", "org/doc", b"data").await.unwrap();
/// assert_eq!(store.get_object("b1", "org/doc").await.unwrap(), Some(b"data".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    buckets: Arc<RwLock<Buckets>>,
    create_requests: Arc<RwLock<Vec<CreateBucketRequest>>>,
    encryption: Arc<RwLock<BTreeMap<String, String>>>,
    create_delay: Option<Duration>,
}

impl MemoryObjectStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every bucket creation take `delay` before it lands, widening
    /// the window in which concurrent provisioners can race.
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Every bucket creation request received so far, in arrival order.
    pub async fn create_requests(&self) -> Vec<CreateBucketRequest> {
        self.create_requests.read().await.clone()
    }

    /// The key reference `bucket` is encrypted with, if any.
    pub async fn bucket_encryption(&self, bucket: &str) -> Option<String> {
        self.encryption.read().await.get(bucket).cloned()
    }

    /// Number of objects currently stored in `bucket`.
    pub async fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .read()
            .await
            .get(bucket)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let buckets = self.buckets.read().await;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::MissingBucket {
                bucket: bucket.to_owned(),
            })?;
        objects.insert(key.to_owned(), body.to_vec());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        if let Some(objects) = buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn create_bucket(&self, request: &CreateBucketRequest) -> Result<(), StorageError> {
        self.create_requests.write().await.push(request.clone());
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.buckets
            .write()
            .await
            .entry(request.bucket.clone())
            .or_default();
        if let Some(ref key_ref) = request.kms_key_ref {
            self.set_bucket_encryption(&request.bucket, key_ref).await?;
        }
        Ok(())
    }

    async fn set_bucket_encryption(&self, bucket: &str, kms_key_ref: &str) -> Result<(), StorageError> {
        if !self.buckets.read().await.contains_key(bucket) {
            return Err(StorageError::MissingBucket {
                bucket: bucket.to_owned(),
            });
        }
        self.encryption
            .write()
            .await
            .insert(bucket.to_owned(), kms_key_ref.to_owned());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bucket(name: &str) -> CreateBucketRequest {
        CreateBucketRequest {
            bucket: name.to_owned(),
            ..CreateBucketRequest::default()
        }
    }

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let store = MemoryObjectStore::new();
        assert_eq!(store.get_object("nope", "does/not/exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_requires_existing_bucket() {
        let store = MemoryObjectStore::new();
        let result = store.put_object("missing", "key", b"v").await;
        assert!(matches!(result, Err(StorageError::MissingBucket { .. })));
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let store = MemoryObjectStore::new();
        store.create_bucket(&bucket("b")).await.unwrap();
        store.put_object("b", "key", b"v1").await.unwrap();
        store.put_object("b", "key", b"v2").await.unwrap();
        assert_eq!(store.get_object("b", "key").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_nonexistent_is_noop() {
        let store = MemoryObjectStore::new();
        store.delete_object("b", "nope").await.unwrap();
        store.create_bucket(&bucket("b")).await.unwrap();
        store.delete_object("b", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let store = MemoryObjectStore::new();
        store.create_bucket(&bucket("b")).await.unwrap();
        store.put_object("b", "key", b"v").await.unwrap();
        store.delete_object("b", "key").await.unwrap();
        assert!(!store.object_exists("b", "key").await.unwrap());
    }

    #[tokio::test]
    async fn create_bucket_is_idempotent_and_recorded() {
        let store = MemoryObjectStore::new();
        store.create_bucket(&bucket("b")).await.unwrap();
        store.put_object("b", "key", b"v").await.unwrap();
        store.create_bucket(&bucket("b")).await.unwrap();

        assert!(store.bucket_exists("b").await.unwrap());
        assert_eq!(store.object_count("b").await, 1);
        assert_eq!(store.create_requests().await.len(), 2);
    }

    #[tokio::test]
    async fn encryption_follows_the_create_request() {
        let store = MemoryObjectStore::new();
        store
            .create_bucket(&CreateBucketRequest {
                bucket: "enc".into(),
                kms_key_ref: Some("crn:key".into()),
                ..CreateBucketRequest::default()
            })
            .await
            .unwrap();
        store.create_bucket(&bucket("plain")).await.unwrap();

        assert_eq!(store.bucket_encryption("enc").await.as_deref(), Some("crn:key"));
        assert_eq!(store.bucket_encryption("plain").await, None);

        store.set_bucket_encryption("plain", "crn:later").await.unwrap();
        assert_eq!(store.bucket_encryption("plain").await.as_deref(), Some("crn:later"));
        assert!(matches!(
            store.set_bucket_encryption("missing", "crn:key").await,
            Err(StorageError::MissingBucket { .. })
        ));
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let store = MemoryObjectStore::new();
        let clone = store.clone();
        store.create_bucket(&bucket("b")).await.unwrap();
        assert!(clone.bucket_exists("b").await.unwrap());
    }
}
