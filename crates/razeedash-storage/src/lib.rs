//! Object storage abstraction for Razeedash.
//!
//! This crate defines the [`ObjectStore`] trait, a bucket/object interface
//! that knows nothing about organizations, envelopes, or encryption. The
//! handlers in `razeedash-core` encrypt payloads before they reach this layer
//! and decide which bucket and key an object lives under.
//!
//! Two implementations are provided:
//!
//! - [`S3ObjectStore`]: production default, any S3-compatible endpoint (feature `s3`)
//! - [`MemoryObjectStore`]: in-memory, for tests and dry runs

mod error;
mod memory;
#[cfg(feature = "s3")]
mod s3_backend;

pub use error::StorageError;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3_backend::{S3ConnectionSettings, S3ObjectStore};

/// Parameters for a bucket creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateBucketRequest {
    /// The bucket to create.
    pub bucket: String,
    /// Provider region / location constraint (e.g. `us-standard`).
    pub location_constraint: Option<String>,
    /// Customer-managed key reference for provider-side encryption.
    pub kms_key_ref: Option<String>,
}

/// A pluggable object storage backend.
///
/// Object keys are `/`-separated UTF-8 strings. Bodies are opaque bytes,
/// already encrypted by the caller when the resource requires it.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync + 'static {
    /// Retrieve an object.
    ///
    /// Returns `Ok(None)` if the object (or its bucket) does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store an object, overwriting any existing body.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingBucket`] if the bucket has not been
    /// created, or [`StorageError::Write`] if the backend fails.
    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError>;

    /// Delete an object. This is idempotent: deleting a non-existent object,
    /// or one in a bucket that does not exist, is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether an object exists.
    ///
    /// The default implementation calls [`get_object`](ObjectStore::get_object).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.get_object(bucket, key).await?.is_some())
    }

    /// Check whether a bucket exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::BucketCheck`] if the backend fails.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Create a bucket. Creating a bucket the caller already owns succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::BucketCreate`] if the backend rejects the request.
    /// When the request carries a key reference and encryption cannot be set
    /// up, the new bucket is removed again and
    /// [`StorageError::BucketEncryption`] is returned.
    async fn create_bucket(&self, request: &CreateBucketRequest) -> Result<(), StorageError>;

    /// Set provider-side default encryption on an existing bucket. Applying
    /// the same key reference twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingBucket`] if the bucket does not exist,
    /// or [`StorageError::BucketEncryption`] if the backend rejects the request.
    async fn set_bucket_encryption(&self, bucket: &str, kms_key_ref: &str) -> Result<(), StorageError>;
}
