//! Integration tests for handler construction and envelope reconstruction.
//!
//! Everything runs against the in-memory object store, lock service, and
//! document store; no network access is needed.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use razeedash_core::config::{KmsSettings, LocationConfig, LockPolicy};
use razeedash_core::connector::MemoryConnector;
use razeedash_core::lock::MemoryLockService;
use razeedash_core::models::{BucketConf, BucketMap, Organization};
use razeedash_core::provisioner::ProvisioningState;
use razeedash_core::store::{MemoryDocumentStore, OrgStore};
use razeedash_core::{
    ConfigHandle, CryptoError, HandlerError, HandlerKind, StorageConfig, StorageFactory,
    StorageHandler,
};
use razeedash_storage::{CreateBucketRequest, ObjectStore};
use serde_json::{Value, json};

const WDC_ENDPOINT: &str = "https://s3.wdc.example.com";
const ORG_KEY: &str = "orgApiKey-5b0e3c1d-8f7a-4b2c-9d1e-2f3a4b5c6d7e";

fn wdc() -> LocationConfig {
    LocationConfig {
        code: "wdc".into(),
        endpoint: WDC_ENDPOINT.into(),
        access_key_id: "ak".into(),
        secret_access_key: "sk".into(),
        location_constraint: Some("us-standard".into()),
        default_bucket: Some("razee-data".into()),
        kms: KmsSettings::default(),
    }
}

fn config(default_handler: HandlerKind) -> StorageConfig {
    StorageConfig {
        default_handler,
        default_location: "wdc".into(),
        locations: BTreeMap::from([("wdc".to_owned(), wdc())]),
        lock: LockPolicy {
            backoff: std::time::Duration::from_millis(5),
            grace: std::time::Duration::from_millis(5),
            ..LockPolicy::default()
        },
        ..StorageConfig::default()
    }
}

fn org(id: &str) -> Organization {
    Organization {
        id: id.to_owned(),
        name: format!("{id}-name"),
        org_keys: vec![ORG_KEY.to_owned()],
        org_keys2: Vec::new(),
        buckets: BucketMap::default(),
        kms_key_ref: None,
        created: Utc::now(),
        updated: Utc::now(),
    }
}

struct Harness {
    handle: ConfigHandle,
    factory: StorageFactory,
    connector: MemoryConnector,
    docs: MemoryDocumentStore,
}

async fn harness(default_handler: HandlerKind) -> Harness {
    let (handle, rx) = ConfigHandle::new(config(default_handler));
    let connector = MemoryConnector::new();
    let docs = MemoryDocumentStore::new();
    docs.insert_org(&org("org1")).await.unwrap();
    let factory = StorageFactory::new(
        rx,
        Arc::new(connector.clone()),
        Arc::new(docs.clone()),
        Arc::new(MemoryLockService::new()),
        Arc::new(ProvisioningState::new()),
    );
    Harness {
        handle,
        factory,
        connector,
        docs,
    }
}

fn assert_invalid(result: Result<razeedash_core::ResourceHandler, HandlerError>, needle: &str) {
    match result {
        Err(err @ HandlerError::InvalidEnvelope { .. }) => assert!(
            err.to_string().contains(needle),
            "expected '{needle}' in: {err}"
        ),
        other => panic!("expected InvalidEnvelope, got {other:?}"),
    }
}

// ── Envelope round trips ─────────────────────────────────────────────

#[tokio::test]
async fn embedded_envelope_roundtrip() {
    let h = harness(HandlerKind::Embedded).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    assert_eq!(handler.kind(), HandlerKind::Embedded);

    let iv = handler.set_data_and_encrypt(b"kind: Deployment", ORG_KEY).await.unwrap();
    let envelope = handler.envelope().unwrap();
    assert_eq!(envelope["metadata"]["type"], "embedded");

    let restored = h.factory.reconstruct(&envelope).unwrap();
    assert_eq!(
        restored.get_data_and_decrypt(ORG_KEY, &iv).await.unwrap(),
        b"kind: Deployment"
    );
}

#[tokio::test]
async fn object_store_envelope_roundtrip() {
    let h = harness(HandlerKind::ObjectStore).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    let iv = handler.set_data_and_encrypt(b"kind: Service", ORG_KEY).await.unwrap();

    let envelope = handler.envelope().unwrap();
    assert_eq!(
        envelope,
        json!({
            "metadata": {"type": "object-store"},
            "data": {
                "path": "org1/res1",
                "bucketName": "razee-data",
                "location": "wdc",
                "endpoint": WDC_ENDPOINT
            }
        })
    );

    let restored = h.factory.reconstruct(&envelope).unwrap();
    assert_eq!(
        restored.get_data_and_decrypt(ORG_KEY, &iv).await.unwrap(),
        b"kind: Service"
    );
    // Stored bytes are ciphertext, not the payload.
    let raw = h
        .connector
        .store(WDC_ENDPOINT)
        .get_object("razee-data", "org1/res1")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(raw, b"kind: Service");
}

#[tokio::test]
async fn org_bucket_envelope_roundtrip() {
    let h = harness(HandlerKind::ObjectStoreOrgBucket).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    handler.set_data(b"plain: true").await.unwrap();

    let envelope = handler.envelope().unwrap();
    assert_eq!(envelope["metadata"]["type"], "object-store-org-bucket");
    assert_eq!(
        envelope["data"]["bucketConfObj"],
        json!({"type": "active", "location": "wdc", "kind": "resources"})
    );
    assert_eq!(envelope["data"]["orgId"], "org1");

    let restored = h.factory.reconstruct(&envelope).unwrap();
    assert_eq!(restored.get_data().await.unwrap(), b"plain: true");

    let conf = BucketConf::Active {
        location: "wdc".into(),
        kind: "resources".into(),
    };
    let recorded = h.docs.find_org("org1").await.unwrap().unwrap();
    assert!(recorded.buckets.get(&conf).is_some());
}

#[tokio::test]
async fn org_bucket_envelope_without_org_id_uses_path() {
    let h = harness(HandlerKind::ObjectStoreOrgBucket).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    handler.set_data(b"payload").await.unwrap();

    let mut envelope = handler.envelope().unwrap();
    envelope["data"].as_object_mut().unwrap().remove("orgId");

    let restored = h.factory.reconstruct(&envelope).unwrap();
    assert_eq!(restored.get_data().await.unwrap(), b"payload");
}

#[tokio::test]
async fn backup_bucket_is_separate_from_active() {
    let h = harness(HandlerKind::ObjectStoreOrgBucket).await;
    let backup = BucketConf::Backup {
        location: "wdc".into(),
        period: "weekly".into(),
    };
    let mut handler = h
        .factory
        .new_org_bucket_handler("org1", "org1/res1", backup.clone())
        .unwrap();
    handler.set_data(b"snapshot").await.unwrap();

    let mut active = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    active.set_data(b"live").await.unwrap();

    let org = h.docs.find_org("org1").await.unwrap().unwrap();
    let active_conf = BucketConf::Active {
        location: "wdc".into(),
        kind: "resources".into(),
    };
    assert_ne!(org.buckets.get(&backup), org.buckets.get(&active_conf));
    assert_eq!(h.connector.store(WDC_ENDPOINT).create_requests().await.len(), 2);
}

// ── Bare strings ─────────────────────────────────────────────────────

#[tokio::test]
async fn bare_string_is_embedded_data() {
    let h = harness(HandlerKind::Embedded).await;
    let handler = h
        .factory
        .reconstruct(&Value::String("kind: ConfigMap".into()))
        .unwrap();
    assert_eq!(handler.kind(), HandlerKind::Embedded);
    assert_eq!(handler.get_data().await.unwrap(), b"kind: ConfigMap");
}

#[tokio::test]
async fn legacy_url_on_configured_location() {
    let h = harness(HandlerKind::Embedded).await;
    let store = h.connector.store(WDC_ENDPOINT);
    store
        .create_bucket(&CreateBucketRequest {
            bucket: "legacy-bucket".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .put_object("legacy-bucket", "org1/res 1", b"old payload")
        .await
        .unwrap();

    let url = Value::String(format!("{WDC_ENDPOINT}/legacy-bucket/org1%2Fres%201"));
    let mut handler = h.factory.reconstruct(&url).unwrap();
    assert_eq!(handler.kind(), HandlerKind::ObjectStoreLegacy);
    assert_eq!(handler.get_data().await.unwrap(), b"old payload");
    assert!(matches!(
        handler.envelope(),
        Err(HandlerError::SerializationNotSupported { .. })
    ));

    handler.delete_data().await.unwrap();
    assert!(matches!(
        handler.delete_data().await,
        Err(HandlerError::NotFound { .. })
    ));
}

#[tokio::test]
async fn legacy_url_on_unknown_host_uses_url_endpoint() {
    let h = harness(HandlerKind::Embedded).await;
    let old = h.connector.store("http://cos.old.example.com:9000");
    old.create_bucket(&CreateBucketRequest {
        bucket: "b".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    old.put_object("b", "k", b"from old endpoint").await.unwrap();

    let handler = h
        .factory
        .reconstruct(&Value::String("http://cos.old.example.com:9000/b/k".into()))
        .unwrap();
    assert_eq!(handler.get_data().await.unwrap(), b"from old endpoint");
}

// ── Malformed envelopes ──────────────────────────────────────────────

#[tokio::test]
async fn malformed_metadata_is_rejected() {
    let h = harness(HandlerKind::Embedded).await;
    for envelope in [
        json!({"data": "x"}),
        json!({"metadata": null, "data": "x"}),
        json!({"metadata": "embedded", "data": "x"}),
        json!({"metadata": {}, "data": "x"}),
        json!({"metadata": {"type": null}, "data": "x"}),
        json!(42),
        Value::Null,
    ] {
        assert_invalid(h.factory.reconstruct(&envelope), "Invalid metadata structure");
    }
}

#[tokio::test]
async fn unknown_type_is_not_defined() {
    let h = harness(HandlerKind::Embedded).await;
    assert_invalid(
        h.factory
            .reconstruct(&json!({"metadata": {"type": "abcd"}, "data": "x"})),
        "is not defined",
    );
}

#[tokio::test]
async fn unconfigured_location_is_a_configuration_error() {
    let h = harness(HandlerKind::Embedded).await;
    let envelope = json!({
        "metadata": {"type": "object-store"},
        "data": {"path": "p", "bucketName": "b", "location": "syd"}
    });
    assert!(matches!(
        h.factory.reconstruct(&envelope),
        Err(HandlerError::Configuration(_))
    ));
}

// ── Lifecycle ────────────────────────────────────────────────────────

fn assert_not_found(result: Result<Vec<u8>, HandlerError>, needles: &[&str]) {
    match result {
        Err(HandlerError::NotFound { target }) => {
            for needle in needles {
                assert!(target.contains(needle), "expected '{needle}' in: {target}");
            }
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn read_after_delete_is_not_found() {
    let h = harness(HandlerKind::ObjectStore).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", Some("named-bucket"), None).unwrap();
    handler.set_data(b"payload").await.unwrap();
    handler.delete_data().await.unwrap();
    // Deleting again is fine for non-legacy variants.
    handler.delete_data().await.unwrap();

    assert_not_found(handler.get_data().await, &["named-bucket/org1/res1"]);
}

#[tokio::test]
async fn org_bucket_read_after_delete_is_not_found() {
    let h = harness(HandlerKind::ObjectStoreOrgBucket).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    handler.set_data(b"payload").await.unwrap();
    handler.delete_data().await.unwrap();
    handler.delete_data().await.unwrap();

    let conf = BucketConf::Active {
        location: "wdc".into(),
        kind: "resources".into(),
    };
    let recorded = h.docs.find_org("org1").await.unwrap().unwrap();
    let bucket = recorded.buckets.get(&conf).unwrap().to_owned();
    assert_not_found(handler.get_data().await, &[format!("{bucket}/org1/res1").as_str()]);
}

#[tokio::test]
async fn org_bucket_before_first_write() {
    let h = harness(HandlerKind::ObjectStoreOrgBucket).await;
    let mut handler = h.factory.new_handler("org1", "org1/never", None, None).unwrap();

    assert_not_found(handler.get_data().await, &["org1/never"]);
    handler.delete_data().await.unwrap();
    assert!(h.connector.store(WDC_ENDPOINT).create_requests().await.is_empty());
}

#[tokio::test]
async fn embedded_read_after_delete_is_not_found() {
    let h = harness(HandlerKind::Embedded).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    handler.set_data(b"payload").await.unwrap();
    handler.delete_data().await.unwrap();
    handler.delete_data().await.unwrap();

    assert_not_found(handler.get_data().await, &["org1/res1"]);
}

#[tokio::test]
async fn wrong_key_is_a_decryption_error() {
    let h = harness(HandlerKind::ObjectStore).await;
    // "secret: value" under ORG_KEY with IV 00..0f.
    let envelope = json!({
        "metadata": { "type": "embedded" },
        "data": "Of9w5EMwL77VGeinpzcewg==",
    });
    let iv = "AAECAwQFBgcICQoLDA0ODw==";
    let handler = h.factory.reconstruct(&envelope).unwrap();

    assert_eq!(
        handler.get_data_and_decrypt(ORG_KEY, iv).await.unwrap(),
        b"secret: value"
    );
    assert!(matches!(
        handler.get_data_and_decrypt("orgApiKey-wrong", iv).await,
        Err(HandlerError::Crypto(CryptoError::Decryption { .. }))
    ));
}

// ── Hot reconfiguration ──────────────────────────────────────────────

#[tokio::test]
async fn published_config_changes_default_variant() {
    let h = harness(HandlerKind::Embedded).await;
    assert_eq!(
        h.factory.new_handler("org1", "k", None, None).unwrap().kind(),
        HandlerKind::Embedded
    );

    h.handle.publish(config(HandlerKind::ObjectStore));
    assert_eq!(
        h.factory.new_handler("org1", "k", None, None).unwrap().kind(),
        HandlerKind::ObjectStore
    );
    assert_eq!(h.factory.config().default_handler, HandlerKind::ObjectStore);
}

#[tokio::test]
async fn reload_keeps_existing_data_reachable() {
    let h = harness(HandlerKind::ObjectStore).await;
    let mut handler = h.factory.new_handler("org1", "org1/res1", None, None).unwrap();
    handler.set_data(b"before reload").await.unwrap();
    let envelope = handler.envelope().unwrap();

    h.handle.publish(config(HandlerKind::Embedded));
    let restored = h.factory.reconstruct(&envelope).unwrap();
    assert_eq!(restored.get_data().await.unwrap(), b"before reload");
}
