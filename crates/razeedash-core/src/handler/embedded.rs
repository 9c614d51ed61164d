//! Payloads stored inline in the envelope.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use super::{HandlerKind, StorageHandler};
use crate::cipher;
use crate::error::HandlerError;

/// Keeps the payload inside the envelope itself.
///
/// Plaintext is held as a UTF-8 string; ciphertext as base64. Nothing
/// leaves the process until the caller persists the envelope.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedHandler {
    data: Option<String>,
    /// Resource key, when the handler was created for a known resource.
    resource: Option<String>,
}

impl EmbeddedHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty handler for the resource stored under `resource_key`.
    #[must_use]
    pub fn for_resource(resource_key: &str) -> Self {
        Self {
            data: None,
            resource: Some(resource_key.to_owned()),
        }
    }

    /// Rebuild from an envelope's `data` member (a string, or `null` once deleted).
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidEnvelope`] for any other JSON type.
    pub fn from_data(data: Value) -> Result<Self, HandlerError> {
        match data {
            Value::String(s) => Ok(Self {
                data: Some(s),
                resource: None,
            }),
            Value::Null => Ok(Self::default()),
            other => Err(HandlerError::InvalidEnvelope {
                reason: format!(
                    "'{}' data must be a string, got {}",
                    HandlerKind::Embedded,
                    json_type(&other)
                ),
            }),
        }
    }

    fn stored(&self) -> Result<&str, HandlerError> {
        self.data.as_deref().ok_or_else(|| HandlerError::NotFound {
            target: self.resource.as_deref().map_or_else(
                || "embedded resource data".to_owned(),
                |key| format!("embedded data for resource '{key}'"),
            ),
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait::async_trait]
impl StorageHandler for EmbeddedHandler {
    async fn set_data_and_encrypt(
        &mut self,
        payload: &[u8],
        org_key: &str,
    ) -> Result<String, HandlerError> {
        let encrypted = cipher::encrypt(payload, org_key)?;
        self.data = Some(BASE64.encode(&encrypted.ciphertext));
        Ok(encrypted.iv)
    }

    async fn set_data(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        let text = std::str::from_utf8(payload).map_err(|e| HandlerError::InvalidPayload {
            reason: format!("embedded plaintext must be UTF-8: {e}"),
        })?;
        self.data = Some(text.to_owned());
        Ok(())
    }

    async fn get_data_and_decrypt(&self, org_key: &str, iv: &str) -> Result<Vec<u8>, HandlerError> {
        let ciphertext = BASE64
            .decode(self.stored()?)
            .map_err(|e| crate::error::CryptoError::Decryption {
                reason: format!("embedded ciphertext is not base64: {e}"),
            })?;
        Ok(cipher::decrypt(&ciphertext, org_key, iv)?)
    }

    async fn get_data(&self) -> Result<Vec<u8>, HandlerError> {
        Ok(self.stored()?.as_bytes().to_vec())
    }

    async fn delete_data(&mut self) -> Result<(), HandlerError> {
        self.data = None;
        Ok(())
    }

    fn serialize(&self) -> Result<Value, HandlerError> {
        Ok(self.data.clone().map_or(Value::Null, Value::String))
    }
}
