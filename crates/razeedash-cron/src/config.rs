//! Command-line configuration for the maintenance jobs.
//!
//! Every flag has an environment variable fallback so the jobs can run as
//! Kubernetes `CronJob`s configured entirely through the pod environment.
//! Storage topology (locations, default handler) is read separately by
//! [`StorageConfig::from_env`](razeedash_core::StorageConfig::from_env).

use clap::{Args, Parser};

/// Settings shared by every job.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// PostgreSQL connection string for the organization and resource documents.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Redis connection string for the bucket provisioning lock. Without it
    /// the lock is process-local.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Report what would change without writing anything.
    #[arg(long, env = "RAZEEDASH_DRY_RUN", default_value = "false")]
    pub dry_run: bool,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, env = "RAZEEDASH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Re-encrypt resources under a fresh organization key.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rotate-org-keys",
    version,
    about = "Rotate organization keys and re-encrypt stored resources",
    long_about = None
)]
pub struct RotateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Rotate organizations whose current key is older than this many days.
    #[arg(long, env = "MAX_KEY_AGE_DAYS", default_value = "90")]
    pub max_key_age_days: u32,

    /// Only consider this organization.
    #[arg(long, env = "ORG_ID")]
    pub org_id: Option<String>,
}

/// Convert legacy organization keys into key records.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "migrate-org-keys",
    version,
    about = "Convert legacy organization keys into key records",
    long_about = None
)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Decrypt each resource with its mapped key before re-pointing it, and
    /// skip resources that fail.
    #[arg(long, env = "MIGRATE_VERIFY", default_value = "false")]
    pub verify: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rotate_defaults() {
        let args =
            RotateArgs::try_parse_from(["rotate-org-keys", "--database-url", "postgres://db"])
                .unwrap();
        assert_eq!(args.max_key_age_days, 90);
        assert!(args.org_id.is_none());
        assert!(!args.common.dry_run);
        assert_eq!(args.common.log_level, "info");
    }

    #[test]
    fn migrate_flags() {
        let args = MigrateArgs::try_parse_from([
            "migrate-org-keys",
            "--database-url",
            "postgres://db",
            "--redis-url",
            "redis://cache",
            "--verify",
            "--dry-run",
        ])
        .unwrap();
        assert!(args.verify);
        assert!(args.common.dry_run);
        assert_eq!(args.common.redis_url.as_deref(), Some("redis://cache"));
    }
}
