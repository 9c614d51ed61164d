//! Organization key registry.
//!
//! Organizations carry keys in two formats:
//!
//! - `orgKeys`: legacy: a list of bare key strings, oldest first.
//! - `orgKeys2`: key records with a uuid, a name, timestamps, and at most
//!   one `primary` flag.
//!
//! Resolution prefers key records and falls back to synthesizing a record
//! from the first legacy key, so callers always work with [`OrgKey`].

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, KeyError};
use crate::models::{BucketMap, OrgKey, Organization};
use crate::store::OrgStore;

/// Prefix of generated key strings.
pub const KEY_PREFIX: &str = "orgApiKey-";

/// Number of trailing characters used as a synthesized key record's name.
const LEGACY_NAME_LEN: usize = 12;

/// Generate a new key string.
#[must_use]
pub fn generate_key_string() -> String {
    format!("{KEY_PREFIX}{}", Uuid::new_v4())
}

/// Generate a new key record with a fresh uuid and timestamps.
#[must_use]
pub fn generate_key_record(primary: bool) -> OrgKey {
    let now = Utc::now();
    let key = generate_key_string();
    OrgKey {
        uuid: Uuid::new_v4().to_string(),
        name: legacy_key_name(&key),
        primary,
        created: Some(now),
        updated: Some(now),
        key,
    }
}

/// The display name of a legacy key: its last 12 characters.
#[must_use]
pub fn legacy_key_name(key: &str) -> String {
    let skip = key.chars().count().saturating_sub(LEGACY_NAME_LEN);
    key.chars().skip(skip).collect()
}

/// Build the key record that stands in for a legacy key string.
///
/// The uuid is the key string itself, which keeps [`key_by_uuid`] able to
/// find it again through the legacy fallback.
#[must_use]
pub fn synthesize_legacy_key(key: &str) -> OrgKey {
    OrgKey {
        uuid: key.to_owned(),
        name: legacy_key_name(key),
        primary: false,
        created: None,
        updated: None,
        key: key.to_owned(),
    }
}

/// Resolve the key new data should be encrypted with.
///
/// The primary record if one is marked, else the first record; with no
/// records, a record synthesized from the first legacy key.
///
/// # Errors
///
/// Returns [`KeyError::NoKey`] if the organization has no keys at all.
pub fn best_key(org: &Organization) -> Result<OrgKey, KeyError> {
    if let Some(key) = org
        .org_keys2
        .iter()
        .find(|k| k.primary)
        .or_else(|| org.org_keys2.first())
    {
        return Ok(key.clone());
    }

    org.org_keys
        .first()
        .map(|legacy| synthesize_legacy_key(legacy))
        .ok_or_else(|| KeyError::NoKey {
            org_id: org.id.clone(),
        })
}

/// Resolve a key by record uuid, or by literal legacy key string.
///
/// # Errors
///
/// Returns [`KeyError::KeyNotFound`] if neither collection matches.
pub fn key_by_uuid(org: &Organization, uuid: &str) -> Result<OrgKey, KeyError> {
    if let Some(key) = org.org_keys2.iter().find(|k| k.uuid == uuid) {
        return Ok(key.clone());
    }

    org.org_keys
        .iter()
        .find(|legacy| legacy.as_str() == uuid)
        .map(|legacy| synthesize_legacy_key(legacy))
        .ok_or_else(|| KeyError::KeyNotFound {
            org_id: org.id.clone(),
            key_id: uuid.to_owned(),
        })
}

/// Return the organization named `name`, creating it if it does not exist.
///
/// New organizations get one freshly generated legacy key. An existing
/// organization is returned unchanged, whatever `explicit_id` says.
///
/// # Errors
///
/// Returns [`DbError`] if the store fails. A concurrent creator winning the
/// insert race is not an error; its organization is returned.
pub async fn create_default_org(
    store: &dyn OrgStore,
    name: &str,
    explicit_id: Option<&str>,
) -> Result<Organization, DbError> {
    if let Some(existing) = store.find_org_by_name(name).await? {
        return Ok(existing);
    }

    let now = Utc::now();
    let org = Organization {
        id: explicit_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_owned),
        name: name.to_owned(),
        org_keys: vec![generate_key_string()],
        org_keys2: Vec::new(),
        buckets: BucketMap::default(),
        kms_key_ref: None,
        created: now,
        updated: now,
    };

    match store.insert_org(&org).await {
        Ok(()) => {
            info!(org_id = %org.id, org_name = %org.name, "default organization created");
            Ok(org)
        }
        Err(DbError::Conflict { .. }) => match store.find_org_by_name(name).await? {
            Some(existing) => Ok(existing),
            None => Err(DbError::Conflict {
                collection: crate::store::ORGS_COLLECTION.to_owned(),
                id: org.id,
            }),
        },
        Err(e) => Err(e),
    }
}
