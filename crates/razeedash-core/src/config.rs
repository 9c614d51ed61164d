//! Storage configuration.
//!
//! Loads the storage topology from environment variables: the default handler
//! variant, the object storage locations (addressed by location code such as
//! `wdc` or `lon`), and the bucket lock policy. [`StorageConfig::from_lookup`]
//! takes any variable source so tests never touch the process environment.
//!
//! A running process can publish a new configuration through a
//! [`ConfigHandle`]; the storage factory picks it up on its next call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ConfigError;
use crate::handler::HandlerKind;

/// Retry and timing policy for the bucket provisioning lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// How long a held lock stays valid if never released.
    pub ttl: Duration,
    /// Acquisition attempts before giving up.
    pub retries: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
    /// Pause before proceeding without the lock.
    pub grace: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retries: 10,
            backoff: Duration::from_millis(500),
            grace: Duration::from_secs(2),
        }
    }
}

/// Provider-side customer-managed encryption for a location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KmsSettings {
    pub enabled: bool,
    /// Fallback key reference for organizations that have none of their own.
    pub root_key_ref: Option<String>,
}

/// Connection settings for one storage location.
#[derive(Clone, PartialEq, Eq)]
pub struct LocationConfig {
    pub code: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub location_constraint: Option<String>,
    /// Bucket used by the single-bucket handler when the caller names none.
    pub default_bucket: Option<String>,
    pub kms: KmsSettings,
}

impl fmt::Debug for LocationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationConfig")
            .field("code", &self.code)
            .field("endpoint", &self.endpoint)
            .field("location_constraint", &self.location_constraint)
            .field("default_bucket", &self.default_bucket)
            .field("kms", &self.kms)
            .finish_non_exhaustive()
    }
}

impl LocationConfig {
    /// Host part of the endpoint URL, lowercased.
    #[must_use]
    pub fn endpoint_host(&self) -> Option<String> {
        url::Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Variant used for newly written resources.
    pub default_handler: HandlerKind,
    /// Location used when a caller names none.
    pub default_location: String,
    /// Configured locations keyed by lowercase location code.
    pub locations: BTreeMap<String, LocationConfig>,
    /// Prefix for derived per-organization bucket names.
    pub bucket_prefix: String,
    /// Storage kind used for the `active` org bucket of new resources.
    pub default_bucket_kind: String,
    /// Upper bound for each object storage request.
    pub request_timeout: Duration,
    pub lock: LockPolicy,
}

impl Default for StorageConfig {
    /// Embedded storage only, no object storage locations.
    fn default() -> Self {
        Self {
            default_handler: HandlerKind::Embedded,
            default_location: String::new(),
            locations: BTreeMap::new(),
            bucket_prefix: "razee".to_owned(),
            default_bucket_kind: "resources".to_owned(),
            request_timeout: Duration::from_secs(30),
            lock: LockPolicy::default(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`from_lookup`](Self::from_lookup).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Variables:
    /// - `STORAGE_DEFAULT_HANDLER`: `embedded`, `object-store`, or
    ///   `object-store-org-bucket` (default: `embedded`)
    /// - `S3_LOCATIONS`: comma-separated location codes (e.g. `wdc,lon`)
    /// - `S3_<LOC>_ENDPOINT`, `S3_<LOC>_ACCESS_KEY_ID`, `S3_<LOC>_SECRET_ACCESS_KEY`: required per location
    /// - `S3_<LOC>_LOCATION_CONSTRAINT`, `S3_<LOC>_BUCKET`: optional per location
    /// - `S3_<LOC>_KMS_ENABLED`, `S3_<LOC>_KMS_ROOT_KEY`: provider-side encryption
    /// - `S3_DEFAULT_LOCATION`: default location code (default: first of `S3_LOCATIONS`)
    /// - `S3_BUCKET_PREFIX`: org bucket name prefix (default: `razee`)
    /// - `STORAGE_DEFAULT_BUCKET_KIND`: org bucket kind for new resources (default: `resources`)
    /// - `S3_REQUEST_TIMEOUT_SECS`: per-request timeout (default: `30`)
    /// - `BUCKET_LOCK_TTL_MS`, `BUCKET_LOCK_RETRIES`, `BUCKET_LOCK_BACKOFF_MS`, `BUCKET_LOCK_GRACE_MS`
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`] for unparsable values, an unknown or legacy
    ///   default handler, or a default location that is not configured.
    /// - [`ConfigError::Missing`] for absent per-location credentials, or no
    ///   locations while an object storage handler is the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_handler = match lookup("STORAGE_DEFAULT_HANDLER") {
            Some(raw) => {
                let kind: HandlerKind = raw.trim().parse().map_err(|reason| ConfigError::Invalid {
                    name: "STORAGE_DEFAULT_HANDLER".to_owned(),
                    reason,
                })?;
                if kind == HandlerKind::ObjectStoreLegacy {
                    return Err(ConfigError::Invalid {
                        name: "STORAGE_DEFAULT_HANDLER".to_owned(),
                        reason: "the legacy handler is read-only and cannot be the default"
                            .to_owned(),
                    });
                }
                kind
            }
            None => defaults.default_handler,
        };

        let codes: Vec<String> = lookup("S3_LOCATIONS")
            .unwrap_or_default()
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let mut locations = BTreeMap::new();
        for code in &codes {
            locations.insert(code.clone(), load_location(&lookup, code)?);
        }

        if default_handler != HandlerKind::Embedded && locations.is_empty() {
            return Err(ConfigError::Missing {
                name: "S3_LOCATIONS".to_owned(),
            });
        }

        let default_location = match lookup("S3_DEFAULT_LOCATION") {
            Some(code) => {
                let code = code.trim().to_lowercase();
                if !locations.contains_key(&code) {
                    return Err(ConfigError::Invalid {
                        name: "S3_DEFAULT_LOCATION".to_owned(),
                        reason: format!("location '{code}' is not listed in S3_LOCATIONS"),
                    });
                }
                code
            }
            None => codes.first().cloned().unwrap_or_default(),
        };

        let lock = LockPolicy {
            ttl: parse_millis(&lookup, "BUCKET_LOCK_TTL_MS")?.unwrap_or(defaults.lock.ttl),
            retries: parse_num(&lookup, "BUCKET_LOCK_RETRIES")?.unwrap_or(defaults.lock.retries),
            backoff: parse_millis(&lookup, "BUCKET_LOCK_BACKOFF_MS")?
                .unwrap_or(defaults.lock.backoff),
            grace: parse_millis(&lookup, "BUCKET_LOCK_GRACE_MS")?.unwrap_or(defaults.lock.grace),
        };

        Ok(Self {
            default_handler,
            default_location,
            locations,
            bucket_prefix: lookup("S3_BUCKET_PREFIX").unwrap_or(defaults.bucket_prefix),
            default_bucket_kind: lookup("STORAGE_DEFAULT_BUCKET_KIND")
                .unwrap_or(defaults.default_bucket_kind),
            request_timeout: parse_num::<u64, _>(&lookup, "S3_REQUEST_TIMEOUT_SECS")?
                .map_or(defaults.request_timeout, Duration::from_secs),
            lock,
        })
    }

    /// Resolve a location by code, falling back to the default location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownLocation`] if no settings exist for it.
    pub fn location(&self, code: Option<&str>) -> Result<&LocationConfig, ConfigError> {
        let code = code.map_or_else(|| self.default_location.clone(), str::to_lowercase);
        self.locations
            .get(&code)
            .ok_or(ConfigError::UnknownLocation { location: code })
    }

    /// Find the configured location whose endpoint host matches `host`.
    #[must_use]
    pub fn location_by_host(&self, host: &str) -> Option<&LocationConfig> {
        let host = host.to_lowercase();
        self.locations
            .values()
            .find(|loc| loc.endpoint_host().as_deref() == Some(host.as_str()))
    }
}

fn load_location<F>(lookup: &F, code: &str) -> Result<LocationConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!("S3_{}", code.to_uppercase());
    let required = |suffix: &str| {
        let name = format!("{prefix}_{suffix}");
        lookup(&name).ok_or(ConfigError::Missing { name })
    };

    let endpoint = required("ENDPOINT")?;
    if url::Url::parse(&endpoint).is_err() {
        return Err(ConfigError::Invalid {
            name: format!("{prefix}_ENDPOINT"),
            reason: format!("'{endpoint}' is not an absolute URL"),
        });
    }

    let kms_enabled = lookup(&format!("{prefix}_KMS_ENABLED"))
        .is_some_and(|v| v == "true" || v == "1");

    Ok(LocationConfig {
        code: code.to_owned(),
        endpoint,
        access_key_id: required("ACCESS_KEY_ID")?,
        secret_access_key: required("SECRET_ACCESS_KEY")?,
        location_constraint: lookup(&format!("{prefix}_LOCATION_CONSTRAINT")),
        default_bucket: lookup(&format!("{prefix}_BUCKET")),
        kms: KmsSettings {
            enabled: kms_enabled,
            root_key_ref: lookup(&format!("{prefix}_KMS_ROOT_KEY")),
        },
    })
}

fn parse_num<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name: name.to_owned(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_millis<F>(lookup: &F, name: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_num::<u64, _>(lookup, name)?.map(Duration::from_millis))
}

/// Publisher side of a hot-reloadable storage configuration.
///
/// Factories hold the receiver returned by [`ConfigHandle::new`]; each
/// [`publish`](ConfigHandle::publish) is picked up on their next call.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<StorageConfig>>>,
}

impl ConfigHandle {
    /// Create a handle seeded with `config`, plus the receiver to hand to a factory.
    #[must_use]
    pub fn new(config: StorageConfig) -> (Self, watch::Receiver<Arc<StorageConfig>>) {
        let (tx, rx) = watch::channel(Arc::new(config));
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Replace the active configuration.
    pub fn publish(&self, config: StorageConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Another receiver for an additional factory.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<StorageConfig>> {
        self.tx.subscribe()
    }

    /// The configuration currently published.
    #[must_use]
    pub fn current(&self) -> Arc<StorageConfig> {
        Arc::clone(&self.tx.borrow())
    }
}
