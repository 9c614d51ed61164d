//! `rotate-org-keys` entry point.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use razeedash_cron::config::RotateArgs;
use razeedash_cron::rotation::{RotationOptions, RotationSummary, rotate_org_keys};
use razeedash_cron::state::JobContext;
use razeedash_cron::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args = RotateArgs::parse();
    telemetry::init(&args.common.log_level);

    info!(
        max_key_age_days = args.max_key_age_days,
        org_id = args.org_id.as_deref().unwrap_or("*"),
        dry_run = args.common.dry_run,
        "rotate-org-keys starting"
    );

    match run(&args).await {
        Ok(summary) => {
            info!(?summary, "rotate-org-keys completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "rotate-org-keys failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &RotateArgs) -> anyhow::Result<RotationSummary> {
    let ctx = JobContext::connect(&args.common).await?;
    let opts = RotationOptions {
        max_key_age: chrono::Duration::days(i64::from(args.max_key_age_days)),
        org_id: args.org_id.clone(),
        dry_run: args.common.dry_run,
    };
    rotate_org_keys(&ctx, &opts)
        .await
        .context("key rotation aborted")
}
