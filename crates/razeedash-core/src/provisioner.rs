//! Bucket provisioning.
//!
//! Buckets are created on first write. Two layers keep concurrent writers
//! from racing each other into duplicate creations:
//!
//! 1. **In-process**: [`ProvisioningState`] tracks one in-flight attempt per
//!    `(location, bucket)`. Later callers join the running attempt and observe
//!    its result instead of starting their own.
//! 2. **Cross-replica**: a bucket that is missing on first check is created
//!    under a named lock from the [`LockService`]. If the lock cannot be taken
//!    within the retry budget, the attempt waits a grace period and proceeds
//!    optimistically: it re-checks existence and creates only if the bucket
//!    is still missing.
//!
//! A bucket that already exists never touches the lock. Once provisioned, a
//! shared bucket is remembered for the life of the process and later writes
//! skip provisioning entirely. Per-organization buckets are memoized on the
//! organization document instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use razeedash_storage::{CreateBucketRequest, ObjectStore, StorageError};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{LocationConfig, LockPolicy};
use crate::error::{ConfigError, ProvisionError};
use crate::lock::{LockService, acquire_with_retry};
use crate::models::{BucketConf, Organization};
use crate::store::OrgStore;

/// Longest bucket name S3-compatible stores accept.
const MAX_BUCKET_NAME_LEN: usize = 63;

/// Hex characters of the org id digest kept in derived bucket names.
const ORG_DIGEST_LEN: usize = 16;

type Attempt = Shared<BoxFuture<'static, Result<(), ProvisionError>>>;

/// Identity of a bucket across replicas: location code plus bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketIdentity {
    pub location: String,
    pub bucket: String,
}

impl BucketIdentity {
    #[must_use]
    pub fn new(location: &str, bucket: &str) -> Self {
        Self {
            location: location.to_owned(),
            bucket: bucket.to_owned(),
        }
    }

    fn lock_name(&self) -> String {
        format!("bucket-provision:{}/{}", self.location, self.bucket)
    }
}

/// In-flight provisioning attempts and buckets known to exist, shared by
/// every handler in the process.
///
/// An in-flight entry is removed when its attempt completes, successfully or
/// not, so a failed attempt never blocks a later retry.
#[derive(Default)]
pub struct ProvisioningState {
    in_flight: Arc<Mutex<HashMap<BucketIdentity, Attempt>>>,
    known: Mutex<HashSet<BucketIdentity>>,
}

impl std::fmt::Debug for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningState").finish_non_exhaustive()
    }
}

impl ProvisioningState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts currently running.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Whether `id` was provisioned earlier in this process.
    pub async fn is_known(&self, id: &BucketIdentity) -> bool {
        self.known.lock().await.contains(id)
    }

    async fn mark_known(&self, id: BucketIdentity) {
        self.known.lock().await.insert(id);
    }

    /// Join the attempt running for `id`, or start one with `start`.
    pub async fn run_or_join<F>(&self, id: BucketIdentity, start: F) -> Result<(), ProvisionError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), ProvisionError>>,
    {
        let attempt = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(running) = in_flight.get(&id) {
                debug!(location = %id.location, bucket = %id.bucket, "joining in-flight provisioning");
                running.clone()
            } else {
                let registry = Arc::clone(&self.in_flight);
                let key = id.clone();
                let work = start();
                let attempt = async move {
                    let result = work.await;
                    registry.lock().await.remove(&key);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(id, attempt.clone());
                attempt
            }
        };
        attempt.await
    }
}

/// Creates buckets at most once per identity, across tasks and replicas.
#[derive(Debug, Clone)]
pub struct BucketProvisioner {
    locks: Arc<dyn LockService>,
    orgs: Arc<dyn OrgStore>,
    state: Arc<ProvisioningState>,
    policy: LockPolicy,
    bucket_prefix: String,
}

impl BucketProvisioner {
    #[must_use]
    pub fn new(
        locks: Arc<dyn LockService>,
        orgs: Arc<dyn OrgStore>,
        state: Arc<ProvisioningState>,
        policy: LockPolicy,
        bucket_prefix: impl Into<String>,
    ) -> Self {
        Self {
            locks,
            orgs,
            state,
            policy,
            bucket_prefix: bucket_prefix.into(),
        }
    }

    /// Make sure `bucket` exists at `location`.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::Storage`] if the store fails the check or creation;
    /// [`ProvisionError::Configuration`] if encryption is enabled for the
    /// location without a key reference.
    pub async fn ensure_bucket(
        &self,
        store: Arc<dyn ObjectStore>,
        location: &LocationConfig,
        bucket: &str,
    ) -> Result<(), ProvisionError> {
        self.run(store, location, bucket, None).await
    }

    /// Make sure the organization's bucket for `conf` exists, and return its name.
    ///
    /// A bucket already recorded on the organization is returned without any
    /// provisioning. Otherwise the name is derived, the bucket provisioned, and
    /// the name recorded under `buckets[category][sub_key][location]`.
    ///
    /// # Errors
    ///
    /// As [`ensure_bucket`](Self::ensure_bucket), plus
    /// [`ProvisionError::OrgNotFound`] and [`ProvisionError::Database`].
    pub async fn ensure_org_bucket(
        &self,
        store: Arc<dyn ObjectStore>,
        location: &LocationConfig,
        org_id: &str,
        conf: &BucketConf,
    ) -> Result<String, ProvisionError> {
        let org = self.load_org(org_id).await?;
        if let Some(bucket) = org.buckets.get(conf) {
            return Ok(bucket.to_owned());
        }

        let bucket = org_bucket_name(&self.bucket_prefix, org_id, conf);
        self.run(store, location, &bucket, Some((org_id.to_owned(), conf.clone())))
            .await?;
        Ok(bucket)
    }

    /// The bucket an organization's data for `conf` lives in, without provisioning.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::OrgNotFound`] or [`ProvisionError::Database`].
    pub async fn org_bucket(&self, org_id: &str, conf: &BucketConf) -> Result<String, ProvisionError> {
        let org = self.load_org(org_id).await?;
        Ok(org
            .buckets
            .get(conf)
            .map_or_else(|| org_bucket_name(&self.bucket_prefix, org_id, conf), str::to_owned))
    }

    async fn load_org(&self, org_id: &str) -> Result<Organization, ProvisionError> {
        self.orgs
            .find_org(org_id)
            .await?
            .ok_or_else(|| ProvisionError::OrgNotFound {
                org_id: org_id.to_owned(),
            })
    }

    async fn run(
        &self,
        store: Arc<dyn ObjectStore>,
        location: &LocationConfig,
        bucket: &str,
        owner: Option<(String, BucketConf)>,
    ) -> Result<(), ProvisionError> {
        let id = BucketIdentity::new(&location.code, bucket);
        // Org buckets are memoized on the organization, not here.
        if owner.is_none() && self.state.is_known(&id).await {
            return Ok(());
        }
        let this = self.clone();
        let location = location.clone();
        let attempt_id = id.clone();
        self.state
            .run_or_join(id, move || {
                async move { this.provision(store, location, attempt_id, owner).await }.boxed()
            })
            .await
    }

    #[instrument(skip_all, fields(location = %id.location, bucket = %id.bucket))]
    async fn provision(
        self,
        store: Arc<dyn ObjectStore>,
        location: LocationConfig,
        id: BucketIdentity,
        owner: Option<(String, BucketConf)>,
    ) -> Result<(), ProvisionError> {
        let exists = store
            .bucket_exists(&id.bucket)
            .await
            .map_err(|e| storage_error(&id.bucket, &e))?;
        if exists {
            debug!("bucket already exists");
            self.settle_existing(store.as_ref(), &location, &id.bucket, owner.as_ref())
                .await?;
            self.state.mark_known(id).await;
            return Ok(());
        }

        let lock_name = id.lock_name();
        let token = match acquire_with_retry(
            self.locks.as_ref(),
            &lock_name,
            self.policy.ttl,
            self.policy.retries,
            self.policy.backoff,
        )
        .await
        {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(
                    error = %e,
                    grace_ms = u64::try_from(self.policy.grace.as_millis()).unwrap_or(u64::MAX),
                    "bucket lock not acquired, proceeding without it"
                );
                tokio::time::sleep(self.policy.grace).await;
                None
            }
        };

        let result = self
            .create_if_missing(store.as_ref(), &location, &id.bucket, owner.as_ref())
            .await;

        if let Some(token) = token {
            if let Err(e) = self.locks.release(&token).await {
                warn!(error = %e, "failed to release bucket lock");
            }
        }
        if result.is_ok() {
            self.state.mark_known(id).await;
        }
        result
    }

    async fn create_if_missing(
        &self,
        store: &dyn ObjectStore,
        location: &LocationConfig,
        bucket: &str,
        owner: Option<&(String, BucketConf)>,
    ) -> Result<(), ProvisionError> {
        if store
            .bucket_exists(bucket)
            .await
            .map_err(|e| storage_error(bucket, &e))?
        {
            debug!("bucket created by a peer");
            return self.settle_existing(store, location, bucket, owner).await;
        }

        let org = self.owner_org(owner).await?;
        let kms_key_ref = resolve_kms_key_ref(location, org.as_ref())?;
        let request = CreateBucketRequest {
            bucket: bucket.to_owned(),
            location_constraint: location.location_constraint.clone(),
            kms_key_ref,
        };
        store
            .create_bucket(&request)
            .await
            .map_err(|e| storage_error(bucket, &e))?;
        info!(kms = request.kms_key_ref.is_some(), "bucket provisioned");

        self.record_owner(owner, bucket).await
    }

    /// Bring an existing bucket in line with the location: apply the
    /// encryption key when encryption is enabled, then record the owner.
    async fn settle_existing(
        &self,
        store: &dyn ObjectStore,
        location: &LocationConfig,
        bucket: &str,
        owner: Option<&(String, BucketConf)>,
    ) -> Result<(), ProvisionError> {
        if location.kms.enabled {
            let org = self.owner_org(owner).await?;
            if let Some(key_ref) = resolve_kms_key_ref(location, org.as_ref())? {
                store
                    .set_bucket_encryption(bucket, &key_ref)
                    .await
                    .map_err(|e| storage_error(bucket, &e))?;
                debug!("bucket encryption applied");
            }
        }
        self.record_owner(owner, bucket).await
    }

    async fn owner_org(
        &self,
        owner: Option<&(String, BucketConf)>,
    ) -> Result<Option<Organization>, ProvisionError> {
        match owner {
            Some((org_id, _)) => Ok(Some(self.load_org(org_id).await?)),
            None => Ok(None),
        }
    }

    async fn record_owner(
        &self,
        owner: Option<&(String, BucketConf)>,
        bucket: &str,
    ) -> Result<(), ProvisionError> {
        if let Some((org_id, conf)) = owner {
            self.orgs.set_bucket(org_id, conf, bucket).await?;
        }
        Ok(())
    }
}

fn storage_error(bucket: &str, e: &StorageError) -> ProvisionError {
    ProvisionError::Storage {
        bucket: bucket.to_owned(),
        reason: e.to_string(),
    }
}

/// The key reference a new bucket should be encrypted with, if any.
///
/// With encryption enabled for the location: the organization's own
/// reference, else the location's root key.
///
/// # Errors
///
/// Returns [`ConfigError::Missing`] if encryption is enabled but neither is set.
pub fn resolve_kms_key_ref(
    location: &LocationConfig,
    org: Option<&Organization>,
) -> Result<Option<String>, ConfigError> {
    if !location.kms.enabled {
        return Ok(None);
    }
    org.and_then(|o| o.kms_key_ref.clone())
        .or_else(|| location.kms.root_key_ref.clone())
        .map(Some)
        .ok_or_else(|| ConfigError::Missing {
            name: format!("S3_{}_KMS_ROOT_KEY", location.code.to_uppercase()),
        })
}

/// Derive the bucket name for an organization's bucket configuration.
///
/// `{prefix}-{category}-{sub_key}-{location}-{digest}`, where `digest` is a
/// prefix of the hex SHA-256 of the org id. Lowercased, restricted to
/// `[a-z0-9-]`, and capped at 63 characters.
#[must_use]
pub fn org_bucket_name(prefix: &str, org_id: &str, conf: &BucketConf) -> String {
    let digest = hex::encode(Sha256::digest(org_id.as_bytes()));
    let raw = format!(
        "{prefix}-{}-{}-{}-{}",
        conf.category(),
        conf.sub_key(),
        conf.location(),
        &digest[..ORG_DIGEST_LEN]
    );

    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if name.len() > MAX_BUCKET_NAME_LEN {
        // Keep the digest, shorten the descriptive part.
        let tail = name.split_off(name.len() - ORG_DIGEST_LEN);
        name.truncate(MAX_BUCKET_NAME_LEN - ORG_DIGEST_LEN - 1);
        name = format!("{}-{tail}", name.trim_end_matches('-'));
    }
    name
}
