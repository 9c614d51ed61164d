//! Resource storage handlers.
//!
//! A handler owns one resource payload's storage location for the duration of
//! an operation. Four variants implement the same [`StorageHandler`]
//! capability set:
//!
//! | variant                    | where the bytes live                           |
//! |----------------------------|------------------------------------------------|
//! | `embedded`                 | inside the envelope on the database record     |
//! | `object-store`             | a caller-named bucket at a configured location |
//! | `object-store-legacy`      | an object addressed by an absolute URL         |
//! | `object-store-org-bucket`  | a per-organization bucket, provisioned on demand |
//!
//! [`ResourceHandler`] is the closed sum of the four. Handlers are transient;
//! what persists is the envelope produced by [`ResourceHandler::envelope`].

mod embedded;
mod legacy;
mod object_store;
mod org_bucket;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use embedded::EmbeddedHandler;
pub use legacy::{LegacyObjectUrl, LegacyUrlHandler, is_legacy_url};
pub use object_store::ObjectStoreHandler;
pub use org_bucket::OrgBucketHandler;

pub(crate) use object_store::ObjectStoreData;
pub(crate) use org_bucket::OrgBucketData;

use crate::error::HandlerError;

/// The registered handler variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerKind {
    Embedded,
    ObjectStore,
    ObjectStoreLegacy,
    ObjectStoreOrgBucket,
}

impl HandlerKind {
    /// The envelope `metadata.type` tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::ObjectStore => "object-store",
            Self::ObjectStoreLegacy => "object-store-legacy",
            Self::ObjectStoreOrgBucket => "object-store-org-bucket",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(Self::Embedded),
            "object-store" => Ok(Self::ObjectStore),
            "object-store-legacy" => Ok(Self::ObjectStoreLegacy),
            "object-store-org-bucket" => Ok(Self::ObjectStoreOrgBucket),
            other => Err(format!("Handler type '{other}' is not defined")),
        }
    }
}

/// The capability set shared by every handler variant.
#[async_trait::async_trait]
pub trait StorageHandler: Send + Sync {
    /// Encrypt `payload` under `org_key` and store it.
    ///
    /// Returns the base64 IV token needed to decrypt it later.
    async fn set_data_and_encrypt(
        &mut self,
        payload: &[u8],
        org_key: &str,
    ) -> Result<String, HandlerError>;

    /// Store `payload` as-is.
    async fn set_data(&mut self, payload: &[u8]) -> Result<(), HandlerError>;

    /// Fetch and decrypt the stored payload.
    ///
    /// # Errors
    ///
    /// [`HandlerError::NotFound`] if nothing is stored; [`HandlerError::Crypto`]
    /// if the key or IV is wrong.
    async fn get_data_and_decrypt(&self, org_key: &str, iv: &str) -> Result<Vec<u8>, HandlerError>;

    /// Fetch the stored payload without decrypting.
    ///
    /// Bytes come back in the variant's storage form. The object store
    /// variants hold raw ciphertext; the embedded variant holds ciphertext
    /// as base64 text, so after [`set_data_and_encrypt`](Self::set_data_and_encrypt)
    /// it returns that text.
    ///
    /// # Errors
    ///
    /// [`HandlerError::NotFound`] if nothing is stored.
    async fn get_data(&self) -> Result<Vec<u8>, HandlerError>;

    /// Remove the stored payload.
    async fn delete_data(&mut self) -> Result<(), HandlerError>;

    /// The handler-specific `data` part of the envelope.
    fn serialize(&self) -> Result<Value, HandlerError>;
}

/// One handler of any registered variant.
#[derive(Debug)]
pub enum ResourceHandler {
    Embedded(EmbeddedHandler),
    ObjectStore(ObjectStoreHandler),
    Legacy(LegacyUrlHandler),
    OrgBucket(OrgBucketHandler),
}

impl ResourceHandler {
    #[must_use]
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Embedded(_) => HandlerKind::Embedded,
            Self::ObjectStore(_) => HandlerKind::ObjectStore,
            Self::Legacy(_) => HandlerKind::ObjectStoreLegacy,
            Self::OrgBucket(_) => HandlerKind::ObjectStoreOrgBucket,
        }
    }

    /// The full envelope: `{ metadata: { type }, data }`.
    ///
    /// # Errors
    ///
    /// Propagates [`StorageHandler::serialize`] errors, notably
    /// [`HandlerError::SerializationNotSupported`] for the legacy variant.
    pub fn envelope(&self) -> Result<Value, HandlerError> {
        Ok(json!({
            "metadata": { "type": self.kind().as_str() },
            "data": self.serialize()?,
        }))
    }

    fn inner(&self) -> &dyn StorageHandler {
        match self {
            Self::Embedded(h) => h,
            Self::ObjectStore(h) => h,
            Self::Legacy(h) => h,
            Self::OrgBucket(h) => h,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn StorageHandler {
        match self {
            Self::Embedded(h) => h,
            Self::ObjectStore(h) => h,
            Self::Legacy(h) => h,
            Self::OrgBucket(h) => h,
        }
    }
}

#[async_trait::async_trait]
impl StorageHandler for ResourceHandler {
    async fn set_data_and_encrypt(
        &mut self,
        payload: &[u8],
        org_key: &str,
    ) -> Result<String, HandlerError> {
        self.inner_mut().set_data_and_encrypt(payload, org_key).await
    }

    async fn set_data(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        self.inner_mut().set_data(payload).await
    }

    async fn get_data_and_decrypt(&self, org_key: &str, iv: &str) -> Result<Vec<u8>, HandlerError> {
        self.inner().get_data_and_decrypt(org_key, iv).await
    }

    async fn get_data(&self) -> Result<Vec<u8>, HandlerError> {
        self.inner().get_data().await
    }

    async fn delete_data(&mut self) -> Result<(), HandlerError> {
        self.inner_mut().delete_data().await
    }

    fn serialize(&self) -> Result<Value, HandlerError> {
        self.inner().serialize()
    }
}

/// Deserialize a variant's `data` object, reporting failures as envelope errors.
fn parse_data<T: serde::de::DeserializeOwned>(kind: HandlerKind, data: Value) -> Result<T, HandlerError> {
    serde_json::from_value(data).map_err(|e| HandlerError::InvalidEnvelope {
        reason: format!("invalid '{kind}' data: {e}"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_roundtrip() {
        for kind in [
            HandlerKind::Embedded,
            HandlerKind::ObjectStore,
            HandlerKind::ObjectStoreLegacy,
            HandlerKind::ObjectStoreOrgBucket,
        ] {
            assert_eq!(kind.as_str().parse::<HandlerKind>().unwrap(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }

    #[test]
    fn unknown_kind_is_not_defined() {
        let err = "abcd".parse::<HandlerKind>().unwrap_err();
        assert!(err.contains("is not defined"));
    }

    #[tokio::test]
    async fn envelope_wraps_data_with_type() {
        let mut handler = ResourceHandler::Embedded(EmbeddedHandler::new());
        handler.set_data(b"kind: Deployment").await.unwrap();
        assert_eq!(
            handler.envelope().unwrap(),
            json!({"metadata": {"type": "embedded"}, "data": "kind: Deployment"})
        );
    }
}
