//! Persistent data models.
//!
//! Organizations own the keys and bucket names; resource records own the
//! envelope that points at their payload. Both serialize in camelCase so
//! documents written by earlier server versions (`orgKeys`, `orgKeys2`,
//! `bucketConfObj`) load unchanged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Organizations ────────────────────────────────────────────────────

/// An organization key record (the `orgKeys2` format).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgKey {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    /// The key string itself. Older documents call it `secret`.
    #[serde(alias = "secret")]
    pub key: String,
}

impl fmt::Debug for OrgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrgKey")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("created", &self.created)
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Provisioned bucket names: category → sub-key → location → bucket name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketMap(BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>);

impl BucketMap {
    /// Look up the bucket recorded for a bucket configuration.
    #[must_use]
    pub fn get(&self, conf: &BucketConf) -> Option<&str> {
        self.0
            .get(conf.category())
            .and_then(|subs| subs.get(conf.sub_key()))
            .and_then(|locations| locations.get(conf.location()))
            .map(String::as_str)
    }

    /// Record the bucket for a bucket configuration, replacing any previous entry.
    pub fn insert(&mut self, conf: &BucketConf, bucket: impl Into<String>) {
        self.0
            .entry(conf.category().to_owned())
            .or_default()
            .entry(conf.sub_key().to_owned())
            .or_default()
            .insert(conf.location().to_owned(), bucket.into());
    }

    /// Whether no bucket has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An organization (tenant).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// Legacy keys, oldest first.
    #[serde(default)]
    pub org_keys: Vec<String>,
    #[serde(default)]
    pub org_keys2: Vec<OrgKey>,
    #[serde(default)]
    pub buckets: BucketMap,
    /// Provider-side customer-managed key reference (e.g. a root key CRN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_ref: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl fmt::Debug for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Organization")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("org_keys", &format_args!("[{} legacy keys]", self.org_keys.len()))
            .field("org_keys2", &self.org_keys2)
            .field("buckets", &self.buckets)
            .finish_non_exhaustive()
    }
}

// ── Buckets ──────────────────────────────────────────────────────────

/// Which per-organization bucket a resource lives in.
///
/// Serialized as the envelope's `bucketConfObj`:
/// `{ "type": "active", "location": "wdc", "kind": "resources" }` or
/// `{ "type": "backup", "location": "wdc", "period": "weekly" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BucketConf {
    /// Live data, sub-keyed by storage kind.
    Active { location: String, kind: String },
    /// Backups, sub-keyed by retention period.
    Backup { location: String, period: String },
}

impl BucketConf {
    /// Provisioning category: `active` or `backup`.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Active { .. } => "active",
            Self::Backup { .. } => "backup",
        }
    }

    /// Storage kind or backup period.
    #[must_use]
    pub fn sub_key(&self) -> &str {
        match self {
            Self::Active { kind, .. } => kind,
            Self::Backup { period, .. } => period,
        }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::Active { location, .. } | Self::Backup { location, .. } => location,
        }
    }
}

// ── Resources ────────────────────────────────────────────────────────

/// A stored resource (deployable version content, resource YAML, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: String,
    pub org_id: String,
    /// Record kind, e.g. `deployable-version`.
    pub kind: String,
    /// The handler envelope, or a bare string for pre-envelope records.
    pub content: serde_json::Value,
    /// Base64 IV; present exactly when `content` is encrypted.
    #[serde(default)]
    pub iv: Option<String>,
    /// Uuid of the `OrgKey` that encrypted `content`. `None` (encrypted with
    /// the first legacy key) or a literal legacy key string mark records that
    /// still use the legacy key representation.
    #[serde(default)]
    pub org_key_uuid: Option<String>,
    pub updated: DateTime<Utc>,
}

impl ResourceRecord {
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.iv.is_some()
    }
}
