//! Document store seams.
//!
//! The storage core needs two collections: organizations and resource
//! records. [`OrgStore`] and [`ResourceStore`] are the narrow contracts it
//! consumes; the database connection itself belongs to the caller.
//!
//! Updates that touch shared organization fields are targeted
//! ([`OrgStore::set_bucket`], [`OrgStore::update_org_keys`]) so that a
//! provisioning replica recording a bucket never overwrites keys written by a
//! rotation job, and vice versa.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::DbError;
use crate::models::{BucketConf, OrgKey, Organization, ResourceRecord};

/// Collection name for organizations.
pub const ORGS_COLLECTION: &str = "orgs";

/// Collection name for resource records.
pub const RESOURCES_COLLECTION: &str = "resources";

/// Access to organization documents.
#[async_trait::async_trait]
pub trait OrgStore: std::fmt::Debug + Send + Sync + 'static {
    /// Fetch an organization by id.
    async fn find_org(&self, org_id: &str) -> Result<Option<Organization>, DbError>;

    /// Fetch an organization by display name.
    async fn find_org_by_name(&self, name: &str) -> Result<Option<Organization>, DbError>;

    /// List every organization.
    async fn list_orgs(&self) -> Result<Vec<Organization>, DbError>;

    /// Insert a new organization.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the id is taken.
    async fn insert_org(&self, org: &Organization) -> Result<(), DbError>;

    /// Replace both key collections of an organization.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the organization does not exist.
    async fn update_org_keys(
        &self,
        org_id: &str,
        org_keys: &[String],
        org_keys2: &[OrgKey],
    ) -> Result<(), DbError>;

    /// Record a provisioned bucket at `buckets[category][sub_key][location]`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the organization does not exist.
    async fn set_bucket(&self, org_id: &str, conf: &BucketConf, bucket: &str)
    -> Result<(), DbError>;
}

/// Access to resource records.
#[async_trait::async_trait]
pub trait ResourceStore: std::fmt::Debug + Send + Sync + 'static {
    /// Fetch a record by id.
    async fn find_resource(&self, id: &str) -> Result<Option<ResourceRecord>, DbError>;

    /// List an organization's records, ordered by id.
    async fn list_resources(&self, org_id: &str) -> Result<Vec<ResourceRecord>, DbError>;

    /// Insert or replace a record.
    async fn save_resource(&self, record: &ResourceRecord) -> Result<(), DbError>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn delete_resource(&self, id: &str) -> Result<(), DbError>;
}

/// In-memory document store for tests and dry runs.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    orgs: Arc<RwLock<BTreeMap<String, Organization>>>,
    resources: Arc<RwLock<BTreeMap<String, ResourceRecord>>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn org_not_found(org_id: &str) -> DbError {
    DbError::NotFound {
        collection: ORGS_COLLECTION.to_owned(),
        id: org_id.to_owned(),
    }
}

#[async_trait::async_trait]
impl OrgStore for MemoryDocumentStore {
    async fn find_org(&self, org_id: &str) -> Result<Option<Organization>, DbError> {
        Ok(self.orgs.read().await.get(org_id).cloned())
    }

    async fn find_org_by_name(&self, name: &str) -> Result<Option<Organization>, DbError> {
        Ok(self
            .orgs
            .read()
            .await
            .values()
            .find(|o| o.name == name)
            .cloned())
    }

    async fn list_orgs(&self) -> Result<Vec<Organization>, DbError> {
        Ok(self.orgs.read().await.values().cloned().collect())
    }

    async fn insert_org(&self, org: &Organization) -> Result<(), DbError> {
        let mut orgs = self.orgs.write().await;
        if orgs.contains_key(&org.id) {
            return Err(DbError::Conflict {
                collection: ORGS_COLLECTION.to_owned(),
                id: org.id.clone(),
            });
        }
        orgs.insert(org.id.clone(), org.clone());
        Ok(())
    }

    async fn update_org_keys(
        &self,
        org_id: &str,
        org_keys: &[String],
        org_keys2: &[OrgKey],
    ) -> Result<(), DbError> {
        let mut orgs = self.orgs.write().await;
        let org = orgs.get_mut(org_id).ok_or_else(|| org_not_found(org_id))?;
        org.org_keys = org_keys.to_vec();
        org.org_keys2 = org_keys2.to_vec();
        org.updated = Utc::now();
        Ok(())
    }

    async fn set_bucket(
        &self,
        org_id: &str,
        conf: &BucketConf,
        bucket: &str,
    ) -> Result<(), DbError> {
        let mut orgs = self.orgs.write().await;
        let org = orgs.get_mut(org_id).ok_or_else(|| org_not_found(org_id))?;
        org.buckets.insert(conf, bucket);
        org.updated = Utc::now();
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryDocumentStore {
    async fn find_resource(&self, id: &str) -> Result<Option<ResourceRecord>, DbError> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn list_resources(&self, org_id: &str) -> Result<Vec<ResourceRecord>, DbError> {
        Ok(self
            .resources
            .read()
            .await
            .values()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn save_resource(&self, record: &ResourceRecord) -> Result<(), DbError> {
        self.resources
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_resource(&self, id: &str) -> Result<(), DbError> {
        self.resources.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::BucketMap;

    fn org(id: &str, name: &str) -> Organization {
        Organization {
            id: id.to_owned(),
            name: name.to_owned(),
            org_keys: vec!["orgApiKey-1".to_owned()],
            org_keys2: Vec::new(),
            buckets: BucketMap::default(),
            kms_key_ref: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_find_by_id_and_name() {
        let store = MemoryDocumentStore::new();
        store.insert_org(&org("o1", "acme")).await.unwrap();
        assert_eq!(store.find_org("o1").await.unwrap().unwrap().name, "acme");
        assert_eq!(store.find_org_by_name("acme").await.unwrap().unwrap().id, "o1");
        assert!(store.find_org_by_name("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = MemoryDocumentStore::new();
        store.insert_org(&org("o1", "acme")).await.unwrap();
        let result = store.insert_org(&org("o1", "acme")).await;
        assert!(matches!(result, Err(DbError::Conflict { .. })));
    }

    #[tokio::test]
    async fn set_bucket_leaves_keys_alone() {
        let store = MemoryDocumentStore::new();
        store.insert_org(&org("o1", "acme")).await.unwrap();
        let conf = BucketConf::Active {
            location: "wdc".into(),
            kind: "resources".into(),
        };
        store.set_bucket("o1", &conf, "bucket-1").await.unwrap();

        let loaded = store.find_org("o1").await.unwrap().unwrap();
        assert_eq!(loaded.buckets.get(&conf), Some("bucket-1"));
        assert_eq!(loaded.org_keys, vec!["orgApiKey-1"]);
    }

    #[tokio::test]
    async fn targeted_updates_require_existing_org() {
        let store = MemoryDocumentStore::new();
        let result = store.update_org_keys("missing", &[], &[]).await;
        assert!(matches!(result, Err(DbError::NotFound { .. })));
    }

    #[tokio::test]
    async fn resources_are_listed_per_org() {
        let store = MemoryDocumentStore::new();
        for (id, org_id) in [("r1", "o1"), ("r2", "o2"), ("r3", "o1")] {
            store
                .save_resource(&ResourceRecord {
                    id: id.to_owned(),
                    org_id: org_id.to_owned(),
                    kind: "deployable-version".to_owned(),
                    content: serde_json::Value::String("data".to_owned()),
                    iv: None,
                    org_key_uuid: None,
                    updated: Utc::now(),
                })
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list_resources("o1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r1", "r3"]);

        store.delete_resource("r1").await.unwrap();
        store.delete_resource("r1").await.unwrap();
        assert!(store.find_resource("r1").await.unwrap().is_none());
    }
}
