//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger: the bucket, the object key, and the provider's reason.

/// Errors that can occur during object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to build a client for the given endpoint.
    #[error("failed to connect to object storage at '{endpoint}': {reason}")]
    Connect { endpoint: String, reason: String },

    /// Failed to read an object.
    #[error("failed to read object '{bucket}/{key}': {reason}")]
    Read {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Failed to write an object.
    #[error("failed to write object '{bucket}/{key}': {reason}")]
    Write {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Failed to delete an object.
    #[error("failed to delete object '{bucket}/{key}': {reason}")]
    Delete {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Failed to check whether a bucket exists.
    #[error("failed to check bucket '{bucket}': {reason}")]
    BucketCheck { bucket: String, reason: String },

    /// The provider rejected a bucket creation request.
    #[error("failed to create bucket '{bucket}': {reason}")]
    BucketCreate { bucket: String, reason: String },

    /// The provider rejected the bucket's encryption configuration.
    #[error("failed to configure encryption for bucket '{bucket}': {reason}")]
    BucketEncryption { bucket: String, reason: String },

    /// A write targeted a bucket that does not exist.
    #[error("bucket '{bucket}' does not exist")]
    MissingBucket { bucket: String },

    /// The provider did not answer within the configured request timeout.
    #[error("object storage request '{operation}' timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },
}
