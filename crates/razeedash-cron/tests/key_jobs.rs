//! End-to-end runs of the rotation and migration jobs against the in-memory
//! document store and object store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use razeedash_core::config::{LocationConfig, LockPolicy};
use razeedash_core::connector::MemoryConnector;
use razeedash_core::lock::MemoryLockService;
use razeedash_core::models::{BucketMap, OrgKey, Organization, ResourceRecord};
use razeedash_core::org_keys::best_key;
use razeedash_core::provisioner::ProvisioningState;
use razeedash_core::store::{MemoryDocumentStore, OrgStore, ResourceStore};
use razeedash_core::{ConfigHandle, DbError, HandlerKind, StorageConfig, StorageFactory, StorageHandler};
use razeedash_cron::migration::{MigrationOptions, migrate_org_keys};
use razeedash_cron::rotation::{RotationOptions, rotate_org_keys};
use razeedash_cron::state::JobContext;
use razeedash_storage::ObjectStore;
use serde_json::json;

const WDC_ENDPOINT: &str = "https://s3.wdc.example.com";
const LEGACY_A: &str = "orgApiKey-0c6f1e52-3b7d-4a89-b0e4-9d2c5a718f30";
const LEGACY_B: &str = "orgApiKey-7a91d4c8-e25b-4f06-8c3a-1b6e0f9d2a57";

struct Harness {
    ctx: JobContext,
    docs: MemoryDocumentStore,
    connector: MemoryConnector,
    _handle: ConfigHandle,
}

fn storage_config() -> StorageConfig {
    let wdc = LocationConfig {
        code: "wdc".into(),
        endpoint: WDC_ENDPOINT.into(),
        access_key_id: "ak".into(),
        secret_access_key: "sk".into(),
        location_constraint: None,
        default_bucket: Some("razee-data".into()),
        kms: razeedash_core::config::KmsSettings::default(),
    };
    StorageConfig {
        default_handler: HandlerKind::ObjectStore,
        default_location: "wdc".into(),
        locations: BTreeMap::from([("wdc".to_owned(), wdc)]),
        lock: LockPolicy {
            backoff: std::time::Duration::from_millis(5),
            grace: std::time::Duration::from_millis(5),
            ..LockPolicy::default()
        },
        ..StorageConfig::default()
    }
}

fn harness() -> Harness {
    let (handle, rx) = ConfigHandle::new(storage_config());
    let connector = MemoryConnector::new();
    let docs = MemoryDocumentStore::new();
    let factory = StorageFactory::new(
        rx,
        Arc::new(connector.clone()),
        Arc::new(docs.clone()),
        Arc::new(MemoryLockService::new()),
        Arc::new(ProvisioningState::new()),
    );
    let ctx = JobContext::new(
        Arc::new(docs.clone()),
        Arc::new(docs.clone()),
        Arc::new(factory),
    );
    Harness {
        ctx,
        docs,
        connector,
        _handle: handle,
    }
}

fn org(id: &str, legacy: &[&str], records: Vec<OrgKey>) -> Organization {
    Organization {
        id: id.to_owned(),
        name: format!("{id}-name"),
        org_keys: legacy.iter().map(|k| (*k).to_owned()).collect(),
        org_keys2: records,
        buckets: BucketMap::default(),
        kms_key_ref: None,
        created: Utc::now(),
        updated: Utc::now(),
    }
}

fn stale_primary(uuid: &str, key: &str) -> OrgKey {
    let created = Utc::now() - Duration::days(200);
    OrgKey {
        uuid: uuid.to_owned(),
        name: "stale".into(),
        primary: true,
        created: Some(created),
        updated: Some(created),
        key: key.to_owned(),
    }
}

/// Encrypt `body` with `key` through the factory and store the record.
async fn write_record(h: &Harness, org_id: &str, id: &str, key: &str, tag: Option<&str>, body: &[u8]) {
    let mut handler = h
        .ctx
        .factory
        .new_handler(org_id, &format!("{org_id}/{id}"), None, None)
        .unwrap();
    let iv = handler.set_data_and_encrypt(body, key).await.unwrap();
    let record = ResourceRecord {
        id: id.to_owned(),
        org_id: org_id.to_owned(),
        kind: "deployable-version".into(),
        content: handler.envelope().unwrap(),
        iv: Some(iv),
        org_key_uuid: tag.map(str::to_owned),
        updated: Utc::now(),
    };
    h.docs.save_resource(&record).await.unwrap();
}

async fn read_record(h: &Harness, id: &str, key: &str) -> Vec<u8> {
    let record = h.docs.find_resource(id).await.unwrap().unwrap();
    let handler = h.ctx.factory.reconstruct(&record.content).unwrap();
    handler
        .get_data_and_decrypt(key, record.iv.as_deref().unwrap())
        .await
        .unwrap()
}

// ── Rotation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn legacy_only_org_is_rotated_and_promoted() {
    let h = harness();
    h.docs.insert_org(&org("org1", &[LEGACY_A], Vec::new())).await.unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, None, b"kind: Deployment").await;
    write_record(&h, "org1", "r2", LEGACY_A, Some(LEGACY_A), b"kind: Service").await;

    let summary = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(summary.keys_created, 1);
    assert_eq!(summary.keys_promoted, 1);
    assert_eq!(summary.resources_reencrypted, 2);
    assert_eq!(summary.resources_failed, 0);

    let rotated = h.docs.find_org("org1").await.unwrap().unwrap();
    assert_eq!(rotated.org_keys2.len(), 1);
    let target = best_key(&rotated).unwrap();
    assert!(target.primary);
    assert_eq!(rotated.org_keys, vec![LEGACY_A.to_owned()]);

    for (id, body) in [("r1", &b"kind: Deployment"[..]), ("r2", &b"kind: Service"[..])] {
        let record = h.docs.find_resource(id).await.unwrap().unwrap();
        assert_eq!(record.org_key_uuid.as_deref(), Some(target.uuid.as_str()));
        assert_eq!(read_record(&h, id, &target.key).await, body);
    }

    let store = h.connector.store(WDC_ENDPOINT);
    assert!(!store.object_exists("razee-data", "org1/r1").await.unwrap());
    assert!(
        store
            .object_exists("razee-data", &format!("org1/r1/{}", target.uuid))
            .await
            .unwrap()
    );
}

/// Delegates to the in-memory store but refuses every save.
#[derive(Debug)]
struct SaveRefused(MemoryDocumentStore);

#[async_trait::async_trait]
impl ResourceStore for SaveRefused {
    async fn find_resource(&self, id: &str) -> Result<Option<ResourceRecord>, DbError> {
        self.0.find_resource(id).await
    }

    async fn list_resources(&self, org_id: &str) -> Result<Vec<ResourceRecord>, DbError> {
        self.0.list_resources(org_id).await
    }

    async fn save_resource(&self, _record: &ResourceRecord) -> Result<(), DbError> {
        Err(DbError::Query {
            collection: "resources".into(),
            reason: "connection reset".into(),
        })
    }

    async fn delete_resource(&self, id: &str) -> Result<(), DbError> {
        self.0.delete_resource(id).await
    }
}

#[tokio::test]
async fn failed_save_leaves_the_record_readable() {
    let mut h = harness();
    h.docs
        .insert_org(&org("org1", &[], vec![stale_primary("k-old", LEGACY_A)]))
        .await
        .unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, Some("k-old"), b"kind: Secret").await;
    let before = h.docs.find_resource("r1").await.unwrap().unwrap();

    h.ctx = JobContext::new(
        Arc::new(h.docs.clone()),
        Arc::new(SaveRefused(h.docs.clone())),
        Arc::clone(&h.ctx.factory),
    );
    let summary = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(summary.resources_failed, 1);
    assert_eq!(summary.keys_promoted, 0);

    let after = h.docs.find_resource("r1").await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(read_record(&h, "r1", LEGACY_A).await, b"kind: Secret");

    // Only the original payload is left behind.
    let store = h.connector.store(WDC_ENDPOINT);
    assert_eq!(store.object_count("razee-data").await, 1);
}

#[tokio::test]
async fn rerun_after_rotation_changes_nothing() {
    let h = harness();
    h.docs
        .insert_org(&org("org1", &[], vec![stale_primary("k-old", LEGACY_A)]))
        .await
        .unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, Some("k-old"), b"payload").await;

    let first = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(first.keys_promoted, 1);
    let after_first = h.docs.find_org("org1").await.unwrap().unwrap();

    let second = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(second.orgs_examined, 1);
    assert_eq!(second.orgs_rotated, 0);
    assert_eq!(second.keys_created, 0);
    assert_eq!(second.resources_reencrypted, 0);
    assert_eq!(h.docs.find_org("org1").await.unwrap().unwrap(), after_first);
}

#[tokio::test]
async fn failed_resource_leaves_key_pending_and_next_run_resumes() {
    let h = harness();
    h.docs
        .insert_org(&org("org1", &[], vec![stale_primary("k-old", LEGACY_A)]))
        .await
        .unwrap();
    write_record(&h, "org1", "good", LEGACY_A, Some("k-old"), b"good payload").await;
    write_record(&h, "org1", "orphan", LEGACY_A, Some("k-unknown"), b"lost").await;

    let first = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(first.keys_created, 1);
    assert_eq!(first.resources_reencrypted, 1);
    assert_eq!(first.resources_failed, 1);
    assert_eq!(first.keys_promoted, 0);

    let pending_org = h.docs.find_org("org1").await.unwrap().unwrap();
    assert_eq!(pending_org.org_keys2.len(), 2);
    let pending = pending_org.org_keys2[1].clone();
    assert!(!pending.primary);
    assert_eq!(best_key(&pending_org).unwrap().uuid, "k-old");

    h.docs.delete_resource("orphan").await.unwrap();

    let second = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(second.keys_created, 0);
    assert_eq!(second.resources_skipped, 1);
    assert_eq!(second.resources_reencrypted, 0);
    assert_eq!(second.keys_promoted, 1);

    let done = h.docs.find_org("org1").await.unwrap().unwrap();
    assert_eq!(done.org_keys2.len(), 2);
    assert_eq!(best_key(&done).unwrap().uuid, pending.uuid);
    assert!(!done.org_keys2[0].primary);
    assert_eq!(read_record(&h, "good", &pending.key).await, b"good payload");
}

#[tokio::test]
async fn rotation_dry_run_writes_nothing() {
    let h = harness();
    let original = org("org1", &[], vec![stale_primary("k-old", LEGACY_A)]);
    h.docs.insert_org(&original).await.unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, Some("k-old"), b"payload").await;
    let record_before = h.docs.find_resource("r1").await.unwrap().unwrap();

    let opts = RotationOptions {
        dry_run: true,
        ..RotationOptions::default()
    };
    let summary = rotate_org_keys(&h.ctx, &opts).await.unwrap();
    assert_eq!(summary.keys_created, 1);
    assert_eq!(summary.resources_reencrypted, 1);

    assert_eq!(h.docs.find_org("org1").await.unwrap().unwrap(), original);
    assert_eq!(h.docs.find_resource("r1").await.unwrap().unwrap(), record_before);
}

#[tokio::test]
async fn rotation_can_target_one_org() {
    let h = harness();
    h.docs.insert_org(&org("org1", &[LEGACY_A], Vec::new())).await.unwrap();
    h.docs.insert_org(&org("org2", &[LEGACY_B], Vec::new())).await.unwrap();

    let opts = RotationOptions {
        org_id: Some("org2".into()),
        ..RotationOptions::default()
    };
    let summary = rotate_org_keys(&h.ctx, &opts).await.unwrap();
    assert_eq!(summary.orgs_examined, 1);
    assert_eq!(summary.orgs_rotated, 1);

    assert!(h.docs.find_org("org1").await.unwrap().unwrap().org_keys2.is_empty());
    assert_eq!(h.docs.find_org("org2").await.unwrap().unwrap().org_keys2.len(), 1);
}

#[tokio::test]
async fn fresh_keys_are_left_alone() {
    let h = harness();
    let mut fresh = stale_primary("k-new", LEGACY_A);
    fresh.created = Some(Utc::now() - Duration::days(3));
    h.docs.insert_org(&org("org1", &[], vec![fresh])).await.unwrap();

    let summary = rotate_org_keys(&h.ctx, &RotationOptions::default()).await.unwrap();
    assert_eq!(summary.orgs_examined, 1);
    assert_eq!(summary.orgs_rotated, 0);
}

// ── Migration ────────────────────────────────────────────────────────

#[tokio::test]
async fn migration_repoints_without_touching_ciphertext() {
    let h = harness();
    h.docs
        .insert_org(&org("org1", &[LEGACY_A, LEGACY_B], Vec::new()))
        .await
        .unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, None, b"first").await;
    write_record(&h, "org1", "r2", LEGACY_B, Some(LEGACY_B), b"second").await;
    let plain = ResourceRecord {
        id: "r3".into(),
        org_id: "org1".into(),
        kind: "resource".into(),
        content: json!("apiVersion: v1"),
        iv: None,
        org_key_uuid: None,
        updated: Utc::now(),
    };
    h.docs.save_resource(&plain).await.unwrap();
    let before: Vec<_> = h.docs.list_resources("org1").await.unwrap();

    let summary = migrate_org_keys(&h.ctx, &MigrationOptions::default()).await.unwrap();
    assert_eq!(summary.keys_created, 2);
    assert_eq!(summary.resources_repointed, 2);
    assert_eq!(summary.orgs_migrated, 1);

    let migrated = h.docs.find_org("org1").await.unwrap().unwrap();
    let record_a = migrated.org_keys2.iter().find(|k| k.key == LEGACY_A).unwrap();
    let record_b = migrated.org_keys2.iter().find(|k| k.key == LEGACY_B).unwrap();
    assert!(record_a.primary);
    assert!(!record_b.primary);

    let r1 = h.docs.find_resource("r1").await.unwrap().unwrap();
    let r2 = h.docs.find_resource("r2").await.unwrap().unwrap();
    assert_eq!(r1.org_key_uuid.as_deref(), Some(record_a.uuid.as_str()));
    assert_eq!(r2.org_key_uuid.as_deref(), Some(record_b.uuid.as_str()));

    for old in &before {
        let new = h.docs.find_resource(&old.id).await.unwrap().unwrap();
        assert_eq!(new.content, old.content);
        assert_eq!(new.iv, old.iv);
    }
    assert_eq!(h.docs.find_resource("r3").await.unwrap().unwrap(), plain);
    assert_eq!(read_record(&h, "r1", &record_a.key).await, b"first");
    assert_eq!(read_record(&h, "r2", &record_b.key).await, b"second");
}

#[tokio::test]
async fn migration_rerun_is_a_no_op() {
    let h = harness();
    h.docs.insert_org(&org("org1", &[LEGACY_A], Vec::new())).await.unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, None, b"first").await;

    migrate_org_keys(&h.ctx, &MigrationOptions::default()).await.unwrap();
    let after_first = h.docs.find_org("org1").await.unwrap().unwrap();

    let second = migrate_org_keys(&h.ctx, &MigrationOptions::default()).await.unwrap();
    assert_eq!(second.keys_created, 0);
    assert_eq!(second.resources_repointed, 0);
    assert_eq!(second.resources_skipped, 1);
    assert_eq!(second.orgs_migrated, 0);
    assert_eq!(h.docs.find_org("org1").await.unwrap().unwrap(), after_first);
}

#[tokio::test]
async fn verify_skips_resources_that_do_not_decrypt() {
    let h = harness();
    h.docs.insert_org(&org("org1", &[LEGACY_A], Vec::new())).await.unwrap();
    write_record(&h, "org1", "good", LEGACY_A, None, b"ok").await;
    let broken = ResourceRecord {
        id: "broken".into(),
        org_id: "org1".into(),
        kind: "resource".into(),
        content: json!({ "metadata": { "type": "embedded" }, "data": null }),
        iv: Some("AAAAAAAAAAAAAAAAAAAAAA==".into()),
        org_key_uuid: None,
        updated: Utc::now(),
    };
    h.docs.save_resource(&broken).await.unwrap();

    let opts = MigrationOptions {
        verify: true,
        dry_run: false,
    };
    let summary = migrate_org_keys(&h.ctx, &opts).await.unwrap();
    assert_eq!(summary.resources_repointed, 1);
    assert_eq!(summary.resources_failed, 1);

    assert!(h.docs.find_resource("good").await.unwrap().unwrap().org_key_uuid.is_some());
    assert_eq!(h.docs.find_resource("broken").await.unwrap().unwrap(), broken);
}

#[tokio::test]
async fn migration_dry_run_writes_nothing() {
    let h = harness();
    let original = org("org1", &[LEGACY_A], Vec::new());
    h.docs.insert_org(&original).await.unwrap();
    write_record(&h, "org1", "r1", LEGACY_A, None, b"first").await;
    let record_before = h.docs.find_resource("r1").await.unwrap().unwrap();

    let opts = MigrationOptions {
        verify: false,
        dry_run: true,
    };
    let summary = migrate_org_keys(&h.ctx, &opts).await.unwrap();
    assert_eq!(summary.keys_created, 1);
    assert_eq!(summary.resources_repointed, 1);

    assert_eq!(h.docs.find_org("org1").await.unwrap().unwrap(), original);
    assert_eq!(h.docs.find_resource("r1").await.unwrap().unwrap(), record_before);
}
