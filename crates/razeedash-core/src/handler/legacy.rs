//! Read-mostly access to objects addressed by an absolute URL.
//!
//! Records written before envelopes existed hold the payload's object URL as
//! a bare string, e.g. `https://s3.wdc.example.com/razee-data/org1%2Fres1`.
//! The first path segment is the bucket; the rest, percent-decoded, is the
//! object key.

use std::fmt;
use std::sync::Arc;

use razeedash_storage::ObjectStore;
use serde_json::Value;
use url::Url;

use super::{HandlerKind, StorageHandler};
use crate::cipher;
use crate::error::HandlerError;

/// Whether a bare string envelope is a legacy object URL.
#[must_use]
pub fn is_legacy_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// The parts of a legacy object URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyObjectUrl {
    /// `scheme://host[:port]` of the storage endpoint.
    pub endpoint: String,
    /// Lowercase endpoint host.
    pub host: String,
    pub bucket: String,
    pub key: String,
}

impl LegacyObjectUrl {
    /// Split a legacy URL into endpoint, bucket, and key.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidEnvelope`] if the URL does not parse or
    /// lacks a bucket or key segment.
    pub fn parse(raw: &str) -> Result<Self, HandlerError> {
        let invalid = |reason: String| HandlerError::InvalidEnvelope {
            reason: format!("legacy object url '{raw}': {reason}"),
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid("no host".to_owned()))?
            .to_lowercase();

        let mut segments = url
            .path_segments()
            .ok_or_else(|| invalid("no path".to_owned()))?
            .filter(|s| !s.is_empty());
        let bucket = segments
            .next()
            .ok_or_else(|| invalid("no bucket segment".to_owned()))?;
        let bucket = urlencoding::decode(bucket)
            .map_err(|e| invalid(e.to_string()))?
            .into_owned();
        let key_parts = segments
            .map(|s| urlencoding::decode(s).map(std::borrow::Cow::into_owned))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(e.to_string()))?;
        if key_parts.is_empty() {
            return Err(invalid("no object key".to_owned()));
        }

        Ok(Self {
            endpoint: url.origin().ascii_serialization(),
            host,
            bucket,
            key: key_parts.join("/"),
        })
    }
}

/// Reads, writes, and deletes an object at a legacy URL.
///
/// Never provisions buckets, and cannot produce an envelope: new data is
/// always written through one of the other variants.
pub struct LegacyUrlHandler {
    store: Arc<dyn ObjectStore>,
    url: String,
    bucket: String,
    key: String,
}

impl fmt::Debug for LegacyUrlHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyUrlHandler")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl LegacyUrlHandler {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, url: &str, parsed: LegacyObjectUrl) -> Self {
        Self {
            store,
            url: url.to_owned(),
            bucket: parsed.bucket,
            key: parsed.key,
        }
    }

    async fn read(&self) -> Result<Vec<u8>, HandlerError> {
        self.store
            .get_object(&self.bucket, &self.key)
            .await?
            .ok_or_else(|| HandlerError::NotFound {
                target: format!("object at '{}'", self.url),
            })
    }
}

#[async_trait::async_trait]
impl StorageHandler for LegacyUrlHandler {
    async fn set_data_and_encrypt(
        &mut self,
        payload: &[u8],
        org_key: &str,
    ) -> Result<String, HandlerError> {
        let encrypted = cipher::encrypt(payload, org_key)?;
        self.store
            .put_object(&self.bucket, &self.key, &encrypted.ciphertext)
            .await?;
        Ok(encrypted.iv)
    }

    async fn set_data(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        self.store.put_object(&self.bucket, &self.key, payload).await?;
        Ok(())
    }

    async fn get_data_and_decrypt(&self, org_key: &str, iv: &str) -> Result<Vec<u8>, HandlerError> {
        let ciphertext = self.read().await?;
        Ok(cipher::decrypt(&ciphertext, org_key, iv)?)
    }

    async fn get_data(&self) -> Result<Vec<u8>, HandlerError> {
        self.read().await
    }

    async fn delete_data(&mut self) -> Result<(), HandlerError> {
        if !self.store.object_exists(&self.bucket, &self.key).await? {
            return Err(HandlerError::NotFound {
                target: format!("object at '{}'", self.url),
            });
        }
        self.store.delete_object(&self.bucket, &self.key).await?;
        Ok(())
    }

    fn serialize(&self) -> Result<Value, HandlerError> {
        Err(HandlerError::SerializationNotSupported {
            kind: HandlerKind::ObjectStoreLegacy.as_str(),
        })
    }
}
