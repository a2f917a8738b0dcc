//! Commands that talk to the remote service.

use anyhow::{bail, Context, Result};
use blockbridge_core::{Config, Side};
use blockbridge_server::cli::ServeArgs;
use blockbridge_sync::{Executor, NotionClient, SyncReport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{load_config, open_store};
use crate::{Choice, RemoteArgs};

fn executor(config: &Config, remote: &RemoteArgs) -> Result<Executor> {
    let Some(api_key) = remote.api_key.as_deref().filter(|k| !k.is_empty()) else {
        bail!("NOTION_API_KEY is not set; pass --api-key or export it");
    };
    let client = NotionClient::new(
        config.remote.api_base.clone(),
        config.remote.api_version.clone(),
        api_key,
        Duration::from_secs(config.remote.timeout_secs),
    )
    .context("failed to build the remote client")?;
    let store = open_store(config)?;
    let executor = Executor::from_config(store, Arc::new(client), config);
    executor.recover()?;
    Ok(executor)
}

fn print_report(report: &SyncReport) -> Result<()> {
    println!(
        "{} <-> {}: {} inserted, {} updated, {} deleted, {} unchanged, {} merged",
        report.local_path,
        report.remote_document_id,
        report.inserted,
        report.updated,
        report.deleted,
        report.unchanged,
        report.merged
    );
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    if report.conflicts > 0 {
        println!(
            "  {} conflict(s) need a decision; see `blockbridge status`",
            report.conflicts
        );
    }
    for failure in &report.failures {
        let hint = if failure.retriable { " (retriable)" } else { "" };
        println!(
            "  entry {} {} failed{}: {}",
            failure.entry_id, failure.block_key, hint, failure.message
        );
    }
    if report.failed > 0 {
        bail!("{} queue entr(ies) failed", report.failed);
    }
    Ok(())
}

pub async fn push(config_path: &Path, file: &str, page: &str, remote: &RemoteArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let executor = executor(&config, remote)?;
    let report = executor.sync_to_remote(file, page).await?;
    print_report(&report)
}

pub async fn pull(config_path: &Path, page: &str, output: &str, remote: &RemoteArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let executor = executor(&config, remote)?;
    let report = executor.sync_from_remote(page, output).await?;
    print_report(&report)
}

pub async fn resolve(
    config_path: &Path,
    id: i64,
    choice: Choice,
    connection_path: Option<String>,
    remote: &RemoteArgs,
) -> Result<()> {
    let config = load_config(config_path)?;
    let executor = executor(&config, remote)?;
    let side = match choice {
        Choice::Local => Side::Local,
        Choice::Remote => Side::Remote,
    };
    let report = executor.resolve_conflict(id, side, connection_path).await?;
    print_report(&report)
}

pub async fn serve(config_path: &Path, args: ServeArgs) -> Result<()> {
    let config = load_config(config_path)?;
    blockbridge_server::run_with_args(args, config).await
}
