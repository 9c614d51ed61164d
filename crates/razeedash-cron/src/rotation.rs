//! Organization key rotation.
//!
//! For each organization whose current key is too old (or that only has
//! legacy keys), a new key record is added and every encrypted resource is
//! re-encrypted under it. The new key becomes primary only once all of the
//! organization's resources have been moved; until then it stays pending and
//! a later run picks it up again, skipping resources already moved.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use razeedash_core::StorageHandler;
use razeedash_core::models::{OrgKey, Organization, ResourceRecord};
use razeedash_core::org_keys::{best_key, generate_key_record, key_by_uuid, synthesize_legacy_key};

use crate::error::JobError;
use crate::records::{decrypt_record, resource_key};
use crate::state::JobContext;

/// What to rotate.
#[derive(Debug, Clone)]
pub struct RotationOptions {
    pub max_key_age: Duration,
    pub org_id: Option<String>,
    pub dry_run: bool,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            max_key_age: Duration::days(90),
            org_id: None,
            dry_run: false,
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub orgs_examined: usize,
    pub orgs_rotated: usize,
    pub keys_created: usize,
    pub keys_promoted: usize,
    pub resources_reencrypted: usize,
    pub resources_skipped: usize,
    pub resources_failed: usize,
    pub orgs_failed: usize,
}

/// Whether `org` is due for rotation at `now`: it only has legacy keys, a
/// rotation was interrupted, or its current key is older than `max_key_age`.
#[must_use]
pub fn needs_rotation(org: &Organization, now: DateTime<Utc>, max_key_age: Duration) -> bool {
    if org.org_keys2.is_empty() {
        return !org.org_keys.is_empty();
    }
    if pending_key(org).is_some() {
        return true;
    }
    best_key(org)
        .ok()
        .and_then(|key| key.created)
        .is_none_or(|created| now - created > max_key_age)
}

/// A key left behind by an interrupted rotation: the last record, if it is
/// not primary and no primary record is newer.
#[must_use]
pub fn pending_key(org: &Organization) -> Option<OrgKey> {
    let last = org.org_keys2.last()?;
    if last.primary {
        return None;
    }
    let last_created = last.created?;
    match org.org_keys2.iter().find(|k| k.primary) {
        Some(primary) if primary.created.is_some_and(|c| c >= last_created) => None,
        _ if org.org_keys2.len() == 1 && org.org_keys.is_empty() => None,
        _ => Some(last.clone()),
    }
}

/// Rotate keys for every organization that needs it.
///
/// # Errors
///
/// Returns [`JobError::Database`] if the organizations cannot be listed.
/// Failures inside one organization are logged and counted.
#[instrument(skip_all, fields(dry_run = opts.dry_run))]
pub async fn rotate_org_keys(
    ctx: &JobContext,
    opts: &RotationOptions,
) -> Result<RotationSummary, JobError> {
    let now = Utc::now();
    let mut summary = RotationSummary::default();

    let orgs = match &opts.org_id {
        Some(id) => ctx.orgs.find_org(id).await?.into_iter().collect(),
        None => ctx.orgs.list_orgs().await?,
    };

    for org in orgs {
        summary.orgs_examined += 1;
        if !needs_rotation(&org, now, opts.max_key_age) {
            continue;
        }
        let org_id = org.id.clone();
        if let Err(e) = rotate_org(ctx, org, opts.dry_run, &mut summary).await {
            warn!(org_id = %org_id, error = %e, "organization rotation failed");
            summary.orgs_failed += 1;
        }
    }

    Ok(summary)
}

async fn rotate_org(
    ctx: &JobContext,
    mut org: Organization,
    dry_run: bool,
    summary: &mut RotationSummary,
) -> Result<(), JobError> {
    let target = if let Some(pending) = pending_key(&org) {
        info!(org_id = %org.id, key = %pending.uuid, "resuming pending key rotation");
        pending
    } else {
        let key = generate_key_record(false);
        org.org_keys2.push(key.clone());
        if !dry_run {
            ctx.orgs
                .update_org_keys(&org.id, &org.org_keys, &org.org_keys2)
                .await?;
        }
        summary.keys_created += 1;
        info!(org_id = %org.id, key = %key.uuid, "rotation key created");
        key
    };
    summary.orgs_rotated += 1;

    let mut failed = 0usize;
    for record in ctx.resources.list_resources(&org.id).await? {
        if !record.is_encrypted() || record.org_key_uuid.as_deref() == Some(target.uuid.as_str()) {
            summary.resources_skipped += 1;
            continue;
        }
        if dry_run {
            summary.resources_reencrypted += 1;
            continue;
        }
        let record_id = record.id.clone();
        match reencrypt(ctx, &org, &target, record).await {
            Ok(()) => summary.resources_reencrypted += 1,
            Err(e) => {
                warn!(org_id = %org.id, resource_id = %record_id, error = %e, "re-encryption failed");
                failed += 1;
            }
        }
    }
    summary.resources_failed += failed;

    if failed > 0 {
        warn!(
            org_id = %org.id,
            failed,
            "key left pending until every resource is re-encrypted"
        );
        return Ok(());
    }

    if !dry_run {
        for key in &mut org.org_keys2 {
            key.primary = key.uuid == target.uuid;
        }
        ctx.orgs
            .update_org_keys(&org.id, &org.org_keys, &org.org_keys2)
            .await?;
    }
    summary.keys_promoted += 1;
    info!(org_id = %org.id, key = %target.uuid, "rotation key promoted to primary");
    Ok(())
}

/// Move one record onto `target`.
///
/// The new ciphertext goes to a fresh object and the record is saved before
/// the old payload is removed, so a failure at any point leaves the record
/// readable with whichever key and IV it names.
async fn reencrypt(
    ctx: &JobContext,
    org: &Organization,
    target: &OrgKey,
    mut record: ResourceRecord,
) -> Result<(), JobError> {
    let key = match record.org_key_uuid.as_deref() {
        Some(uuid) => key_by_uuid(org, uuid)?,
        // Untagged records were written with the first legacy key.
        None => match org.org_keys.first() {
            Some(legacy) => synthesize_legacy_key(legacy),
            None => best_key(org)?,
        },
    };
    let plaintext = decrypt_record(ctx, &record, &key).await?;

    let mut fresh = ctx
        .factory
        .new_handler(&org.id, &resource_key(&record, &target.uuid), None, None)?;
    let iv = fresh.set_data_and_encrypt(&plaintext, &target.key).await?;

    let previous = std::mem::replace(&mut record.content, fresh.envelope()?);
    record.iv = Some(iv);
    record.org_key_uuid = Some(target.uuid.clone());
    record.updated = Utc::now();
    if let Err(e) = ctx.resources.save_resource(&record).await {
        if let Err(cleanup) = fresh.delete_data().await {
            debug!(resource_id = %record.id, error = %cleanup, "unsaved payload not removed");
        }
        return Err(e.into());
    }

    if previous != record.content {
        remove_previous(ctx, &record.id, &previous).await;
    }
    Ok(())
}

/// Best-effort removal of a payload no record points at any more.
async fn remove_previous(ctx: &JobContext, resource_id: &str, envelope: &Value) {
    let result = match ctx.factory.reconstruct(envelope) {
        Ok(mut handler) => handler.delete_data().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(resource_id, error = %e, "previous payload left in place");
    }
}
