//! Building object store clients for configured locations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use razeedash_storage::{MemoryObjectStore, ObjectStore};

use crate::config::LocationConfig;

/// Turns location settings into an object store client.
///
/// Called whenever the factory (re)builds its location registry, and for
/// legacy URLs whose endpoint matches no configured location.
pub trait ObjectStoreConnector: fmt::Debug + Send + Sync + 'static {
    fn connect(&self, location: &LocationConfig, request_timeout: Duration) -> Arc<dyn ObjectStore>;
}

/// Connects to S3-compatible endpoints.
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Connector;

#[cfg(feature = "s3")]
impl ObjectStoreConnector for S3Connector {
    fn connect(&self, location: &LocationConfig, request_timeout: Duration) -> Arc<dyn ObjectStore> {
        Arc::new(razeedash_storage::S3ObjectStore::connect(
            &razeedash_storage::S3ConnectionSettings {
                endpoint: location.endpoint.clone(),
                access_key_id: location.access_key_id.clone(),
                secret_access_key: location.secret_access_key.clone(),
                location_constraint: location.location_constraint.clone(),
                request_timeout,
            },
        ))
    }
}

/// Hands out one in-memory store per endpoint.
///
/// Connecting twice to the same endpoint yields the same store, so data
/// survives registry rebuilds the way it would on a real service.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    stores: Arc<Mutex<HashMap<String, MemoryObjectStore>>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind `endpoint`, created empty if never connected.
    #[must_use]
    pub fn store(&self, endpoint: &str) -> MemoryObjectStore {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_owned())
            .or_default()
            .clone()
    }

    /// Use `store` for `endpoint` from now on.
    pub fn insert(&self, endpoint: &str, store: MemoryObjectStore) {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_owned(), store);
    }
}

impl ObjectStoreConnector for MemoryConnector {
    fn connect(&self, location: &LocationConfig, _request_timeout: Duration) -> Arc<dyn ObjectStore> {
        Arc::new(self.store(&location.endpoint))
    }
}
