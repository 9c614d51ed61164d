//! Shared state for a job run.
//!
//! A single [`JobContext`] is built at startup and handed to the job. It
//! holds the document stores and the storage factory the job reads and
//! rewrites resources through.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use razeedash_core::connector::S3Connector;
use razeedash_core::lock::{LockService, MemoryLockService, RedisLockService};
use razeedash_core::postgres_store::PgDocumentStore;
use razeedash_core::provisioner::ProvisioningState;
use razeedash_core::store::{OrgStore, ResourceStore};
use razeedash_core::{ConfigHandle, StorageConfig, StorageFactory};

use crate::config::CommonArgs;

/// Everything a job needs to reach organizations and resources.
pub struct JobContext {
    pub orgs: Arc<dyn OrgStore>,
    pub resources: Arc<dyn ResourceStore>,
    pub factory: Arc<StorageFactory>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext").finish_non_exhaustive()
    }
}

impl JobContext {
    #[must_use]
    pub fn new(
        orgs: Arc<dyn OrgStore>,
        resources: Arc<dyn ResourceStore>,
        factory: Arc<StorageFactory>,
    ) -> Self {
        Self {
            orgs,
            resources,
            factory,
        }
    }

    /// Connect to the database, the lock service, and the configured
    /// object storage locations.
    ///
    /// # Errors
    ///
    /// Fails if the storage configuration is invalid or the database or
    /// Redis cannot be reached.
    pub async fn connect(args: &CommonArgs) -> anyhow::Result<Self> {
        let storage = StorageConfig::from_env().context("invalid storage configuration")?;
        info!(
            default_handler = %storage.default_handler,
            locations = storage.locations.len(),
            "storage configuration loaded"
        );

        let docs = Arc::new(
            PgDocumentStore::connect(&args.database_url)
                .await
                .context("failed to connect to the database")?,
        );

        let locks: Arc<dyn LockService> = match &args.redis_url {
            Some(url) => {
                info!("using redis bucket lock");
                Arc::new(
                    RedisLockService::connect(url)
                        .await
                        .context("failed to connect to redis")?,
                )
            }
            None => {
                info!("REDIS_URL not set, using process-local bucket lock");
                Arc::new(MemoryLockService::new())
            }
        };

        // Jobs run with a fixed configuration; the handle is dropped.
        let (_handle, rx) = ConfigHandle::new(storage);
        let factory = StorageFactory::new(
            rx,
            Arc::new(S3Connector),
            Arc::clone(&docs) as Arc<dyn OrgStore>,
            locks,
            Arc::new(ProvisioningState::new()),
        );

        let orgs = Arc::clone(&docs) as Arc<dyn OrgStore>;
        Ok(Self::new(orgs, docs, Arc::new(factory)))
    }
}
