//! Queue inspection and maintenance. None of these reach the remote side.

use anyhow::Result;
use blockbridge_store::{documents, queue as sync_queue, DocumentLink, QueueCounts, SyncQueueEntry};
use blockbridge_types::QueueStatus;
use chrono::Utc;
use serde::Serialize;
use std::path::Path;

use super::{load_config, open_store, print_json};

#[derive(Serialize)]
struct StatusResponse {
    counts: QueueCounts,
    documents: Vec<DocumentLink>,
    conflicts: Vec<SyncQueueEntry>,
}

pub fn status(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let (counts, documents, conflicts) = store.read(|c| {
        Ok((
            sync_queue::counts(c)?,
            documents::list(c)?,
            sync_queue::with_status(c, QueueStatus::Conflict, None)?,
        ))
    })?;

    if json {
        return print_json(&StatusResponse {
            counts,
            documents,
            conflicts,
        });
    }

    println!("pending     {}", counts.pending_count);
    println!("processing  {}", counts.processing_count);
    println!("success     {}", counts.success_count);
    println!("error       {}", counts.error_count);
    println!("conflict    {}", counts.conflict_count);
    println!("total       {}", counts.total);
    if !documents.is_empty() {
        println!("\nDocuments:");
        for doc in &documents {
            let synced = doc
                .last_synced
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!("- {} -> {} (synced {})", doc.local_path, doc.remote_document_id, synced);
        }
    }
    if !conflicts.is_empty() {
        println!("\nConflicts:");
        for entry in &conflicts {
            println!(
                "- {} {} {}",
                entry.id,
                entry.block_key,
                entry.error_message.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(())
}

pub fn queue(config_path: &Path, limit: usize, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let entries = store.read(|c| sync_queue::recent(c, limit))?;

    if json {
        return print_json(&entries);
    }
    for entry in &entries {
        let mut line = format!(
            "{:>5}  {:<10} {:<11} {:<6} {}",
            entry.id,
            entry.status.as_str(),
            entry.direction.as_str(),
            entry.change_type.as_str(),
            entry.block_key
        );
        if let Some(message) = &entry.error_message {
            line.push_str(&format!("  ({message})"));
        }
        println!("{line}");
    }
    Ok(())
}

pub fn retry(config_path: &Path, id: i64) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let entry = store.transaction(|c| {
        sync_queue::requeue(c, id)?;
        sync_queue::get(c, id)
    })?;
    println!(
        "entry {} requeued; it applies on the next sync of {}",
        entry.id,
        entry.local_path.as_deref().unwrap_or("its document")
    );
    Ok(())
}

pub fn clear(config_path: &Path, keep_days: Option<u32>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let keep_days = keep_days.unwrap_or(config.sync.keep_completed_days);
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
    let removed = store.write(|c| sync_queue::clear_completed(c, cutoff))?;
    println!("removed {removed} completed entries older than {keep_days} days");
    Ok(())
}
