//! Payloads stored in per-organization buckets.

use std::fmt;
use std::sync::Arc;

use razeedash_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HandlerKind, StorageHandler, parse_data};
use crate::cipher;
use crate::config::LocationConfig;
use crate::error::HandlerError;
use crate::models::BucketConf;
use crate::provisioner::BucketProvisioner;

/// Envelope `data` of the `object-store-org-bucket` variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrgBucketData {
    pub path: String,
    pub bucket_conf_obj: BucketConf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Absent on early records, whose paths start with the org id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl OrgBucketData {
    pub(crate) fn parse(data: Value) -> Result<Self, HandlerError> {
        parse_data(HandlerKind::ObjectStoreOrgBucket, data)
    }

    /// The owning organization: `orgId`, else the first path segment.
    pub(crate) fn owner(&self) -> Result<String, HandlerError> {
        if let Some(org_id) = self.org_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(org_id.to_owned());
        }
        self.path
            .split('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| HandlerError::InvalidEnvelope {
                reason: format!(
                    "'{}' data names no organization",
                    HandlerKind::ObjectStoreOrgBucket
                ),
            })
    }
}

/// Stores the payload at `path` in the organization's bucket for a
/// [`BucketConf`]. The bucket is derived, provisioned, and recorded on the
/// organization on first write.
pub struct OrgBucketHandler {
    store: Arc<dyn ObjectStore>,
    provisioner: BucketProvisioner,
    location: LocationConfig,
    org_id: String,
    conf: BucketConf,
    path: String,
}

impl fmt::Debug for OrgBucketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrgBucketHandler")
            .field("org_id", &self.org_id)
            .field("conf", &self.conf)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl OrgBucketHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        provisioner: BucketProvisioner,
        location: LocationConfig,
        org_id: impl Into<String>,
        conf: BucketConf,
        path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provisioner,
            location,
            org_id: org_id.into(),
            conf,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn bucket_conf(&self) -> &BucketConf {
        &self.conf
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn write(&self, body: &[u8]) -> Result<(), HandlerError> {
        let bucket = self
            .provisioner
            .ensure_org_bucket(Arc::clone(&self.store), &self.location, &self.org_id, &self.conf)
            .await?;
        self.store.put_object(&bucket, &self.path, body).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, HandlerError> {
        let bucket = self.provisioner.org_bucket(&self.org_id, &self.conf).await?;
        self.store
            .get_object(&bucket, &self.path)
            .await?
            .ok_or_else(|| HandlerError::NotFound {
                target: format!(
                    "object '{bucket}/{}' at location '{}'",
                    self.path, self.location.code
                ),
            })
    }
}

#[async_trait::async_trait]
impl StorageHandler for OrgBucketHandler {
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
        let bucket = self.provisioner.org_bucket(&self.org_id, &self.conf).await?;
        self.store.delete_object(&bucket, &self.path).await?;
        Ok(())
    }

    fn serialize(&self) -> Result<Value, HandlerError> {
        let data = OrgBucketData {
            path: self.path.clone(),
            bucket_conf_obj: self.conf.clone(),
            endpoint: Some(self.location.endpoint.clone()),
            org_id: Some(self.org_id.clone()),
        };
        serde_json::to_value(data).map_err(|e| HandlerError::InvalidEnvelope {
            reason: e.to_string(),
        })
    }
}
