//! S3-compatible object store, the production default.
//!
//! Wraps `aws-sdk-s3` behind the [`ObjectStore`] trait. One client is built per
//! storage location (endpoint + credentials + location constraint). Every
//! request is bounded by the configured timeout.
//!
//! Encryption and key naming happen above this layer (in the handlers).

use std::future::Future;
use std::time::Duration;

use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata as _};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, ServerSideEncryption,
    ServerSideEncryptionByDefault, ServerSideEncryptionConfiguration, ServerSideEncryptionRule,
};
use tracing::{debug, info, warn};

use crate::{CreateBucketRequest, ObjectStore, StorageError};

/// Region passed to the SDK when the location has no explicit constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for one S3-compatible endpoint.
#[derive(Clone)]
pub struct S3ConnectionSettings {
    /// Endpoint URL, e.g. `https://s3.us-south.cloud-object-storage.appdomain.cloud`.
    pub endpoint: String,
    /// HMAC access key id.
    pub access_key_id: String,
    /// HMAC secret access key.
    pub secret_access_key: String,
    /// Region / location constraint, used for signing and bucket creation.
    pub location_constraint: Option<String>,
    /// Upper bound for every request issued by this store.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for S3ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ConnectionSettings")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("location_constraint", &self.location_constraint)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// An object store backed by an S3-compatible service.
///
/// Cheap to clone; the SDK client is reference counted internally.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use razeedash_storage::{S3ConnectionSettings, S3ObjectStore};
/// let store = S3ObjectStore::connect(&S3ConnectionSettings {
///     endpoint: "http://localhost:9000".into(),
///     access_key_id: "minio".into(),
///     secret_access_key: "minio123".into(),
///     location_constraint: None,
///     request_timeout: Duration::from_secs(30),
/// });
/// ```
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
    location_constraint: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    /// Build a client for the given endpoint.
    ///
    /// No request is made; connectivity problems surface on first use.
    #[must_use]
    pub fn connect(settings: &S3ConnectionSettings) -> Self {
        let creds = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "razeedash",
        );
        let region = settings
            .location_constraint
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_owned());

        let config = aws_sdk_s3::Config::builder()
            .region(Region::new(region))
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .endpoint_url(&settings.endpoint)
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        debug!(endpoint = %settings.endpoint, "S3 object store client built");

        Self {
            client: Client::from_conf(config),
            endpoint: settings.endpoint.clone(),
            location_constraint: settings.location_constraint.clone(),
            timeout: settings.request_timeout,
        }
    }

    /// Return the endpoint this store talks to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = T> + Send,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout {
                operation: operation.to_owned(),
                secs: self.timeout.as_secs(),
            })
    }

    /// Best-effort removal of a bucket this store just created.
    async fn roll_back_bucket(&self, bucket: &str) {
        match self
            .bounded("delete_bucket", self.client.delete_bucket().bucket(bucket).send())
            .await
        {
            Ok(Ok(_)) => info!(bucket, "unencrypted bucket removed after failed encryption setup"),
            Ok(Err(e)) => warn!(bucket, error = %DisplayErrorContext(&e), "failed to remove unencrypted bucket"),
            Err(e) => warn!(bucket, error = %e, "failed to remove unencrypted bucket"),
        }
    }
}

/// Whether a provider error code means the object or its bucket is absent.
fn is_missing(code: Option<&str>) -> bool {
    matches!(code, Some("NoSuchKey" | "NoSuchBucket" | "NotFound"))
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let result = self
            .bounded(
                "get_object",
                self.client.get_object().bucket(bucket).key(key).send(),
            )
            .await?;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() || is_missing(service_err.code()) {
                    return Ok(None);
                }
                return Err(StorageError::Read {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                    reason: DisplayErrorContext(&service_err).to_string(),
                });
            }
        };

        let body = output.body.collect().await.map_err(|e| StorageError::Read {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            reason: format!("body read failed: {e}"),
        })?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError> {
        self.bounded(
            "put_object",
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(body.to_vec()))
                .send(),
        )
        .await?
        .map_err(|e| StorageError::Write {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            reason: DisplayErrorContext(&e).to_string(),
        })?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let result = self
            .bounded(
                "delete_object",
                self.client.delete_object().bucket(bucket).key(key).send(),
            )
            .await?;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if is_missing(service_err.code()) {
                    debug!(bucket, key, "delete of absent object ignored");
                    Ok(())
                } else {
                    Err(StorageError::Delete {
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                        reason: DisplayErrorContext(&service_err).to_string(),
                    })
                }
            }
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let result = self
            .bounded("head_bucket", self.client.head_bucket().bucket(bucket).send())
            .await?;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::BucketCheck {
                        bucket: bucket.to_owned(),
                        reason: DisplayErrorContext(&service_err).to_string(),
                    })
                }
            }
        }
    }

    async fn create_bucket(&self, request: &CreateBucketRequest) -> Result<(), StorageError> {
        let mut call = self.client.create_bucket().bucket(&request.bucket);
        let constraint = request
            .location_constraint
            .as_ref()
            .or(self.location_constraint.as_ref());
        if let Some(constraint) = constraint {
            call = call.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(constraint.as_str()))
                    .build(),
            );
        }

        let created = match self.bounded("create_bucket", call.send()).await? {
            Ok(_) => {
                info!(bucket = %request.bucket, endpoint = %self.endpoint, "bucket created");
                true
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_owned_by_you() {
                    debug!(bucket = %request.bucket, "bucket already owned, treating as created");
                    false
                } else {
                    return Err(StorageError::BucketCreate {
                        bucket: request.bucket.clone(),
                        reason: DisplayErrorContext(&service_err).to_string(),
                    });
                }
            }
        };

        if let Some(ref key_ref) = request.kms_key_ref {
            if let Err(e) = self.set_bucket_encryption(&request.bucket, key_ref).await {
                // Never leave a bucket behind that should have been encrypted.
                if created {
                    self.roll_back_bucket(&request.bucket).await;
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn set_bucket_encryption(&self, bucket: &str, kms_key_ref: &str) -> Result<(), StorageError> {
        let encryption_err = |reason: String| StorageError::BucketEncryption {
            bucket: bucket.to_owned(),
            reason,
        };

        let by_default = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::AwsKms)
            .kms_master_key_id(kms_key_ref)
            .build()
            .map_err(|e| encryption_err(e.to_string()))?;
        let rule = ServerSideEncryptionRule::builder()
            .apply_server_side_encryption_by_default(by_default)
            .build();
        let config = ServerSideEncryptionConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| encryption_err(e.to_string()))?;

        self.bounded(
            "put_bucket_encryption",
            self.client
                .put_bucket_encryption()
                .bucket(bucket)
                .server_side_encryption_configuration(config)
                .send(),
        )
        .await?
        .map_err(|e| {
            let service_err = e.into_service_error();
            if is_missing(service_err.code()) {
                StorageError::MissingBucket {
                    bucket: bucket.to_owned(),
                }
            } else {
                encryption_err(DisplayErrorContext(&service_err).to_string())
            }
        })?;

        debug!(bucket, "bucket default encryption set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_object_and_bucket_codes_are_missing() {
        assert!(is_missing(Some("NoSuchKey")));
        assert!(is_missing(Some("NoSuchBucket")));
        assert!(is_missing(Some("NotFound")));
    }

    #[test]
    fn other_codes_are_failures() {
        assert!(!is_missing(Some("AccessDenied")));
        assert!(!is_missing(Some("InternalError")));
        assert!(!is_missing(None));
    }
}
