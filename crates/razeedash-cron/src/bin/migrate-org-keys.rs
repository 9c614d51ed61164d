//! `migrate-org-keys` entry point.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use razeedash_cron::config::MigrateArgs;
use razeedash_cron::migration::{MigrationOptions, MigrationSummary, migrate_org_keys};
use razeedash_cron::state::JobContext;
use razeedash_cron::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args = MigrateArgs::parse();
    telemetry::init(&args.common.log_level);

    info!(
        verify = args.verify,
        dry_run = args.common.dry_run,
        "migrate-org-keys starting"
    );

    match run(&args).await {
        Ok(summary) => {
            info!(?summary, "migrate-org-keys completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "migrate-org-keys failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &MigrateArgs) -> anyhow::Result<MigrationSummary> {
    let ctx = JobContext::connect(&args.common).await?;
    let opts = MigrationOptions {
        verify: args.verify,
        dry_run: args.common.dry_run,
    };
    migrate_org_keys(&ctx, &opts)
        .await
        .context("key migration aborted")
}
