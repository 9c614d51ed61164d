//! Payloads stored as objects in a caller-named bucket.

use std::fmt;
use std::sync::Arc;

use razeedash_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HandlerKind, StorageHandler, parse_data};
use crate::cipher;
use crate::config::LocationConfig;
use crate::error::HandlerError;
use crate::provisioner::BucketProvisioner;

/// Envelope `data` of the `object-store` variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectStoreData {
    pub path: String,
    pub bucket_name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ObjectStoreData {
    pub(crate) fn parse(data: Value) -> Result<Self, HandlerError> {
        parse_data(HandlerKind::ObjectStore, data)
    }
}

/// Stores the payload at `path` in a named bucket at one location.
///
/// The bucket is provisioned on first write.
pub struct ObjectStoreHandler {
    store: Arc<dyn ObjectStore>,
    provisioner: BucketProvisioner,
    location: LocationConfig,
    bucket: String,
    path: String,
}

impl fmt::Debug for ObjectStoreHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreHandler")
            .field("location", &self.location.code)
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        provisioner: BucketProvisioner,
        location: LocationConfig,
        bucket: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provisioner,
            location,
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn write(&self, body: &[u8]) -> Result<(), HandlerError> {
        self.provisioner
            .ensure_bucket(Arc::clone(&self.store), &self.location, &self.bucket)
            .await?;
        self.store.put_object(&self.bucket, &self.path, body).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, HandlerError> {
        self.store
            .get_object(&self.bucket, &self.path)
            .await?
            .ok_or_else(|| HandlerError::NotFound {
                target: format!(
                    "object '{}/{}' at location '{}'",
                    self.bucket, self.path, self.location.code
                ),
            })
    }
}

#[async_trait::async_trait]
impl StorageHandler for ObjectStoreHandler {
    async fn set_data_and_encrypt(
        &mut self,
        payload: &[u8],
        org_key: &str,
    ) -> Result<String, HandlerError> {
        let encrypted = cipher::encrypt(payload, org_key)?;
        self.write(&encrypted.ciphertext).await?;
        Ok(encrypted.iv)
    }

    async fn set_data(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        self.write(payload).await
    }

    async fn get_data_and_decrypt(&self, org_key: &str, iv: &str) -> Result<Vec<u8>, HandlerError> {
        let ciphertext = self.read().await?;
        Ok(cipher::decrypt(&ciphertext, org_key, iv)?)
    }

    async fn get_data(&self) -> Result<Vec<u8>, HandlerError> {
        self.read().await
    }

    async fn delete_data(&mut self) -> Result<(), HandlerError> {
        self.store.delete_object(&self.bucket, &self.path).await?;
        Ok(())
    }

    fn serialize(&self) -> Result<Value, HandlerError> {
        let data = ObjectStoreData {
            path: self.path.clone(),
            bucket_name: self.bucket.clone(),
            location: self.location.code.clone(),
            endpoint: Some(self.location.endpoint.clone()),
        };
        serde_json::to_value(data).map_err(|e| HandlerError::InvalidEnvelope {
            reason: e.to_string(),
        })
    }
}
