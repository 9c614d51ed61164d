//! Legacy organization key migration.
//!
//! Legacy keys (`orgKeys`) are bare strings. Migration gives each one a key
//! record in `orgKeys2` holding the same key string, then re-points resources
//! that reference a legacy key at the new record's uuid. Ciphertext is never
//! touched, so a migrated resource decrypts exactly as before.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use razeedash_core::models::{OrgKey, Organization, ResourceRecord};
use razeedash_core::org_keys::legacy_key_name;

use crate::error::JobError;
use crate::records::decrypt_record;
use crate::state::JobContext;

#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Decrypt each resource with its mapped key before re-pointing it.
    pub verify: bool,
    pub dry_run: bool,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub orgs_examined: usize,
    pub orgs_migrated: usize,
    pub keys_created: usize,
    pub resources_repointed: usize,
    pub resources_skipped: usize,
    pub resources_failed: usize,
    pub orgs_failed: usize,
}

/// Append a key record for every legacy key that has none yet.
///
/// Returns the records created. The first one is marked primary when the
/// organization has no primary record.
pub fn add_missing_key_records(org: &mut Organization) -> Vec<OrgKey> {
    let now = Utc::now();
    let mut has_primary = org.org_keys2.iter().any(|k| k.primary);
    let mut created = Vec::new();

    for legacy in &org.org_keys {
        if org.org_keys2.iter().any(|k| &k.key == legacy) {
            continue;
        }
        let record = OrgKey {
            uuid: Uuid::new_v4().to_string(),
            name: legacy_key_name(legacy),
            primary: !has_primary,
            created: Some(now),
            updated: Some(now),
            key: legacy.clone(),
        };
        has_primary = true;
        org.org_keys2.push(record.clone());
        created.push(record);
    }
    created
}

/// The record uuid a legacy-tagged resource should point at, keyed by the
/// legacy key string.
fn legacy_uuid_map(org: &Organization) -> HashMap<&str, &OrgKey> {
    org.org_keys
        .iter()
        .filter_map(|legacy| {
            org.org_keys2
                .iter()
                .find(|k| &k.key == legacy)
                .map(|record| (legacy.as_str(), record))
        })
        .collect()
}

/// The key record a resource maps to, if it still uses the legacy tagging.
fn mapped_key<'a>(
    org: &Organization,
    map: &HashMap<&str, &'a OrgKey>,
    record: &ResourceRecord,
) -> Option<&'a OrgKey> {
    match record.org_key_uuid.as_deref() {
        None => org
            .org_keys
            .first()
            .and_then(|first| map.get(first.as_str()).copied()),
        Some(tag) if org.org_keys2.iter().any(|k| k.uuid == tag) => None,
        Some(tag) => map.get(tag).copied(),
    }
}

/// Migrate every organization that still has legacy keys.
///
/// # Errors
///
/// Returns [`JobError::Database`] if the organizations cannot be listed.
/// Failures inside one organization are logged and counted.
#[instrument(skip_all, fields(verify = opts.verify, dry_run = opts.dry_run))]
pub async fn migrate_org_keys(
    ctx: &JobContext,
    opts: &MigrationOptions,
) -> Result<MigrationSummary, JobError> {
    let mut summary = MigrationSummary::default();

    for org in ctx.orgs.list_orgs().await? {
        summary.orgs_examined += 1;
        if org.org_keys.is_empty() {
            continue;
        }
        let org_id = org.id.clone();
        if let Err(e) = migrate_org(ctx, org, opts, &mut summary).await {
            warn!(org_id = %org_id, error = %e, "organization migration failed");
            summary.orgs_failed += 1;
        }
    }

    Ok(summary)
}

async fn migrate_org(
    ctx: &JobContext,
    mut org: Organization,
    opts: &MigrationOptions,
    summary: &mut MigrationSummary,
) -> Result<(), JobError> {
    let created = add_missing_key_records(&mut org);
    if !created.is_empty() {
        if !opts.dry_run {
            ctx.orgs
                .update_org_keys(&org.id, &org.org_keys, &org.org_keys2)
                .await?;
        }
        summary.keys_created += created.len();
        info!(org_id = %org.id, created = created.len(), "legacy keys migrated to key records");
    }

    let map = legacy_uuid_map(&org);
    let mut touched = !created.is_empty();

    for mut record in ctx.resources.list_resources(&org.id).await? {
        if !record.is_encrypted() {
            continue;
        }
        let Some(key) = mapped_key(&org, &map, &record) else {
            summary.resources_skipped += 1;
            continue;
        };

        if opts.verify {
            if let Err(e) = decrypt_record(ctx, &record, key).await {
                warn!(
                    org_id = %org.id,
                    resource_id = %record.id,
                    error = %e,
                    "resource does not decrypt with its mapped key, skipping"
                );
                summary.resources_failed += 1;
                continue;
            }
        }

        touched = true;
        if opts.dry_run {
            summary.resources_repointed += 1;
            continue;
        }
        record.org_key_uuid = Some(key.uuid.clone());
        record.updated = Utc::now();
        match ctx.resources.save_resource(&record).await {
            Ok(()) => {
                debug!(resource_id = %record.id, key = %key.uuid, "resource re-pointed");
                summary.resources_repointed += 1;
            }
            Err(e) => {
                warn!(org_id = %org.id, resource_id = %record.id, error = %e, "resource update failed");
                summary.resources_failed += 1;
            }
        }
    }

    if touched {
        summary.orgs_migrated += 1;
    }
    Ok(())
}
