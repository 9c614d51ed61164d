//! Error types for `razeedash-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Errors never include key material, only organization ids,
//! key uuids, bucket names, and object paths.

use razeedash_storage::StorageError;

/// Errors from the payload cipher.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-CBC encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-CBC decryption failed (wrong key, wrong IV, or corrupted ciphertext).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// The IV token is not valid base64 for a 16-byte IV.
    #[error("invalid iv token: {reason}")]
    InvalidIv { reason: String },
}

/// Errors from loading or resolving storage configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing configuration '{name}'")]
    Missing { name: String },

    /// A setting is present but unusable.
    #[error("invalid configuration '{name}': {reason}")]
    Invalid { name: String, reason: String },

    /// No settings exist for the requested storage location.
    #[error("storage location '{location}' is not configured")]
    UnknownLocation { location: String },
}

/// Errors from organization key resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    /// The organization has neither key records nor legacy keys.
    #[error("organization '{org_id}' has no encryption keys")]
    NoKey { org_id: String },

    /// No key record or legacy key matches the requested identifier.
    #[error("key '{key_id}' not found for organization '{org_id}'")]
    KeyNotFound { org_id: String, key_id: String },
}

/// Errors from the document store (organizations, resource records).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    /// Could not connect to or bootstrap the database.
    #[error("database connection failed: {reason}")]
    Connect { reason: String },

    /// A query failed.
    #[error("database query on '{collection}' failed: {reason}")]
    Query { collection: String, reason: String },

    /// A unique constraint was violated.
    #[error("document '{id}' already exists in '{collection}'")]
    Conflict { collection: String, id: String },

    /// The targeted document does not exist.
    #[error("document '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    /// A stored document could not be (de)serialized.
    #[error("document serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the distributed lock service.
///
/// Lock failures are never fatal to provisioning; they trigger the
/// optimistic fallback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The lock could not be acquired within the retry budget, or the lock
    /// service is unreachable.
    #[error("lock '{name}' unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

/// Errors from bucket provisioning.
///
/// Cloneable because one provisioning attempt may be awaited by many
/// callers at once.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    /// The location or its encryption settings are not usable.
    #[error("provisioning configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The object store failed while checking or creating the bucket.
    #[error("provisioning of bucket '{bucket}' failed: {reason}")]
    Storage { bucket: String, reason: String },

    /// The bucket name could not be recorded on the organization.
    #[error("provisioning database error: {0}")]
    Database(#[from] DbError),

    /// The organization the bucket belongs to does not exist.
    #[error("organization '{org_id}' not found")]
    OrgNotFound { org_id: String },
}

/// Errors from storage handlers and the storage factory.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Handler construction failed on missing or invalid settings.
    #[error("handler configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A persisted envelope is malformed or names an unknown handler type.
    #[error("invalid resource envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// No data exists at the handler's target.
    #[error("resource data not found: {target}")]
    NotFound { target: String },

    /// Encryption or decryption failed.
    #[error("handler crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The handler variant cannot produce an envelope.
    #[error("handler '{kind}' does not support serialization")]
    SerializationNotSupported { kind: &'static str },

    /// The payload cannot be stored by this handler variant.
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// The object store returned an error.
    #[error("handler storage error: {0}")]
    Storage(#[from] StorageError),

    /// The target bucket could not be provisioned.
    #[error("handler provisioning error: {0}")]
    Provision(#[from] ProvisionError),
}
