//! Helpers for reading and rewriting encrypted resource records.

use razeedash_core::models::{OrgKey, ResourceRecord};
use razeedash_core::StorageHandler;

use crate::error::JobError;
use crate::state::JobContext;

/// The object key a record's payload is written under once encrypted with
/// the key `key_uuid`.
///
/// Each key gets its own object, so a rewrite never replaces the payload the
/// stored record still points at.
#[must_use]
pub fn resource_key(record: &ResourceRecord, key_uuid: &str) -> String {
    format!("{}/{}/{key_uuid}", record.org_id, record.id)
}

/// Decrypt a record's payload with `key`.
///
/// # Errors
///
/// [`JobError::InvalidRecord`] if the record carries no IV; handler errors
/// if the envelope is malformed, the payload is missing, or decryption fails.
pub async fn decrypt_record(
    ctx: &JobContext,
    record: &ResourceRecord,
    key: &OrgKey,
) -> Result<Vec<u8>, JobError> {
    let iv = record.iv.as_deref().ok_or_else(|| JobError::InvalidRecord {
        id: record.id.clone(),
        reason: "encrypted record has no iv".to_owned(),
    })?;
    let handler = ctx.factory.reconstruct(&record.content)?;
    Ok(handler.get_data_and_decrypt(&key.key, iv).await?)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn resource_keys_differ_per_key() {
        let record = ResourceRecord {
            id: "r1".into(),
            org_id: "org1".into(),
            kind: "resource".into(),
            content: serde_json::Value::Null,
            iv: None,
            org_key_uuid: None,
            updated: Utc::now(),
        };
        assert_eq!(resource_key(&record, "k1"), "org1/r1/k1");
        assert_ne!(resource_key(&record, "k1"), resource_key(&record, "k2"));
    }
}
