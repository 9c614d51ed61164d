//! Storage factory.
//!
//! Builds handlers for new resources according to the configured default
//! variant, and rebuilds handlers from persisted envelopes. Holds one object
//! store client per configured location; when a new [`StorageConfig`] is
//! published through a [`ConfigHandle`](crate::config::ConfigHandle), the
//! next call rebuilds that registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use razeedash_storage::ObjectStore;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{LocationConfig, StorageConfig};
use crate::connector::ObjectStoreConnector;
use crate::error::{ConfigError, HandlerError};
use crate::handler::{
    EmbeddedHandler, HandlerKind, LegacyObjectUrl, LegacyUrlHandler, ObjectStoreData,
    ObjectStoreHandler, OrgBucketData, OrgBucketHandler, ResourceHandler, is_legacy_url,
};
use crate::lock::LockService;
use crate::models::BucketConf;
use crate::provisioner::{BucketProvisioner, ProvisioningState};
use crate::store::OrgStore;

/// Everything derived from one configuration snapshot.
struct Registry {
    config: Arc<StorageConfig>,
    stores: BTreeMap<String, Arc<dyn ObjectStore>>,
    provisioner: BucketProvisioner,
}

impl Registry {
    fn location(&self, code: Option<&str>) -> Result<(&LocationConfig, Arc<dyn ObjectStore>), ConfigError> {
        let location = self.config.location(code)?;
        let store = self
            .stores
            .get(&location.code)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownLocation {
                location: location.code.clone(),
            })?;
        Ok((location, store))
    }

    fn org_bucket_handler(
        &self,
        org_id: &str,
        resource_key: &str,
        conf: BucketConf,
    ) -> Result<ResourceHandler, HandlerError> {
        let (location, store) = self.location(Some(conf.location()))?;
        Ok(ResourceHandler::OrgBucket(OrgBucketHandler::new(
            store,
            self.provisioner.clone(),
            location.clone(),
            org_id,
            conf,
            resource_key,
        )))
    }
}

struct Live {
    rx: watch::Receiver<Arc<StorageConfig>>,
    registry: Arc<Registry>,
}

/// Long-lived collaborators every registry is built from.
struct Deps {
    connector: Arc<dyn ObjectStoreConnector>,
    orgs: Arc<dyn OrgStore>,
    locks: Arc<dyn LockService>,
    state: Arc<ProvisioningState>,
}

impl Deps {
    fn build_registry(&self, config: Arc<StorageConfig>) -> Registry {
        let stores = config
            .locations
            .iter()
            .map(|(code, location)| {
                (
                    code.clone(),
                    self.connector.connect(location, config.request_timeout),
                )
            })
            .collect();
        let provisioner = BucketProvisioner::new(
            Arc::clone(&self.locks),
            Arc::clone(&self.orgs),
            Arc::clone(&self.state),
            config.lock,
            config.bucket_prefix.clone(),
        );
        debug!(
            default_handler = %config.default_handler,
            locations = config.locations.len(),
            "storage registry built"
        );
        Registry {
            config,
            stores,
            provisioner,
        }
    }
}

/// Creates and reconstructs [`ResourceHandler`]s.
pub struct StorageFactory {
    live: Mutex<Live>,
    deps: Deps,
}

impl fmt::Debug for StorageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageFactory")
            .field("connector", &self.deps.connector)
            .finish_non_exhaustive()
    }
}

impl StorageFactory {
    /// Create a factory following the configuration published on `config`.
    ///
    /// `state` is the process-wide in-flight provisioning registry; share one
    /// instance between every factory in a process.
    #[must_use]
    pub fn new(
        mut config: watch::Receiver<Arc<StorageConfig>>,
        connector: Arc<dyn ObjectStoreConnector>,
        orgs: Arc<dyn OrgStore>,
        locks: Arc<dyn LockService>,
        state: Arc<ProvisioningState>,
    ) -> Self {
        let deps = Deps {
            connector,
            orgs,
            locks,
            state,
        };
        let snapshot = Arc::clone(&config.borrow_and_update());
        let registry = Arc::new(deps.build_registry(snapshot));
        Self {
            live: Mutex::new(Live {
                rx: config,
                registry,
            }),
            deps,
        }
    }

    /// The registry for the latest published configuration.
    fn registry(&self) -> Arc<Registry> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        // A dropped publisher leaves the last configuration in force.
        if live.rx.has_changed().unwrap_or(false) {
            let config = Arc::clone(&live.rx.borrow_and_update());
            live.registry = Arc::new(self.deps.build_registry(config));
            info!(
                default_handler = %live.registry.config.default_handler,
                "storage configuration reloaded"
            );
        }
        Arc::clone(&live.registry)
    }

    /// The configuration the factory is currently following.
    #[must_use]
    pub fn config(&self) -> Arc<StorageConfig> {
        Arc::clone(&self.registry().config)
    }

    /// A handler of the configured default variant for a new resource.
    ///
    /// `bucket_name` applies to the `object-store` variant (falling back to
    /// the location's default bucket); `location` to both object storage
    /// variants (falling back to the default location).
    ///
    /// # Errors
    ///
    /// [`HandlerError::Configuration`] if the location is unknown or no bucket
    /// can be determined.
    pub fn new_handler(
        &self,
        org_id: &str,
        resource_key: &str,
        bucket_name: Option<&str>,
        location: Option<&str>,
    ) -> Result<ResourceHandler, HandlerError> {
        let registry = self.registry();
        match registry.config.default_handler {
            HandlerKind::Embedded => Ok(ResourceHandler::Embedded(EmbeddedHandler::for_resource(
                resource_key,
            ))),
            HandlerKind::ObjectStore => {
                let (location, store) = registry.location(location)?;
                let bucket = bucket_name
                    .map(str::to_owned)
                    .or_else(|| location.default_bucket.clone())
                    .ok_or_else(|| ConfigError::Missing {
                        name: format!("S3_{}_BUCKET", location.code.to_uppercase()),
                    })?;
                Ok(ResourceHandler::ObjectStore(ObjectStoreHandler::new(
                    store,
                    registry.provisioner.clone(),
                    location.clone(),
                    bucket,
                    resource_key,
                )))
            }
            HandlerKind::ObjectStoreOrgBucket => {
                let (location, _) = registry.location(location)?;
                let conf = BucketConf::Active {
                    location: location.code.clone(),
                    kind: registry.config.default_bucket_kind.clone(),
                };
                registry.org_bucket_handler(org_id, resource_key, conf)
            }
            HandlerKind::ObjectStoreLegacy => Err(ConfigError::Invalid {
                name: "STORAGE_DEFAULT_HANDLER".to_owned(),
                reason: "the legacy handler cannot create new resources".to_owned(),
            }
            .into()),
        }
    }

    /// An org-bucket handler for an explicit bucket configuration, whatever
    /// the default variant is.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Configuration`] if the configuration's location is unknown.
    pub fn new_org_bucket_handler(
        &self,
        org_id: &str,
        resource_key: &str,
        bucket_conf: BucketConf,
    ) -> Result<ResourceHandler, HandlerError> {
        self.registry()
            .org_bucket_handler(org_id, resource_key, bucket_conf)
    }

    /// Rebuild the handler for a persisted envelope.
    ///
    /// Bare strings are pre-envelope records: an `http(s)://` URL selects the
    /// legacy variant, anything else is embedded data. No I/O happens here.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::InvalidEnvelope`] for a malformed envelope: the message
    ///   contains "Invalid metadata structure" when `metadata.type` is missing,
    ///   and "is not defined" for an unknown type.
    /// - [`HandlerError::Configuration`] if the envelope names an unconfigured
    ///   location.
    pub fn reconstruct(&self, envelope: &Value) -> Result<ResourceHandler, HandlerError> {
        let registry = self.registry();
        let map = match envelope {
            Value::String(raw) if is_legacy_url(raw) => return self.legacy_handler(&registry, raw),
            Value::String(raw) => {
                return Ok(ResourceHandler::Embedded(EmbeddedHandler::from_data(
                    Value::String(raw.clone()),
                )?));
            }
            Value::Object(map) => map,
            _ => return Err(invalid_metadata()),
        };

        let type_tag = map
            .get("metadata")
            .and_then(Value::as_object)
            .and_then(|metadata| metadata.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(invalid_metadata)?;
        let kind: HandlerKind = type_tag
            .parse()
            .map_err(|reason| HandlerError::InvalidEnvelope { reason })?;
        let data = map.get("data").cloned().unwrap_or(Value::Null);

        match kind {
            HandlerKind::Embedded => Ok(ResourceHandler::Embedded(EmbeddedHandler::from_data(data)?)),
            HandlerKind::ObjectStore => {
                let data = ObjectStoreData::parse(data)?;
                let (location, store) = registry.location(Some(&data.location))?;
                Ok(ResourceHandler::ObjectStore(ObjectStoreHandler::new(
                    store,
                    registry.provisioner.clone(),
                    location.clone(),
                    data.bucket_name,
                    data.path,
                )))
            }
            HandlerKind::ObjectStoreLegacy => match data {
                Value::String(raw) => self.legacy_handler(&registry, &raw),
                _ => Err(HandlerError::InvalidEnvelope {
                    reason: format!("'{kind}' data must be an object url"),
                }),
            },
            HandlerKind::ObjectStoreOrgBucket => {
                let data = OrgBucketData::parse(data)?;
                let org_id = data.owner()?;
                registry.org_bucket_handler(&org_id, &data.path, data.bucket_conf_obj)
            }
        }
    }

    fn legacy_handler(&self, registry: &Registry, raw: &str) -> Result<ResourceHandler, HandlerError> {
        let parsed = LegacyObjectUrl::parse(raw)?;
        let store = if let Some(location) = registry.config.location_by_host(&parsed.host) {
            registry.location(Some(&location.code))?.1
        } else {
            let (default, _) = registry.location(None)?;
            let mut pointed = default.clone();
            pointed.endpoint.clone_from(&parsed.endpoint);
            debug!(
                endpoint = %parsed.endpoint,
                location = %default.code,
                "legacy url matches no location, using default credentials"
            );
            self.deps.connector.connect(&pointed, registry.config.request_timeout)
        };
        Ok(ResourceHandler::Legacy(LegacyUrlHandler::new(store, raw, parsed)))
    }
}

fn invalid_metadata() -> HandlerError {
    HandlerError::InvalidEnvelope {
        reason: "Invalid metadata structure: expected { metadata: { type }, data }".to_owned(),
    }
}
