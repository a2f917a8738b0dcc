//! Local change summary for the vault.

use anyhow::Result;
use blockbridge_sync::{detect_local_changes, ChangeKind};
use std::path::Path;

use super::{load_config, open_store, print_json};

pub fn changes(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let changes = detect_local_changes(&store, &config.vault_dir())?;

    if json {
        return print_json(&changes);
    }
    let mut unchanged = 0;
    for change in &changes {
        if change.kind == ChangeKind::Unchanged {
            unchanged += 1;
            continue;
        }
        println!("{:<9} {}", change.kind.to_string(), change.local_path);
    }
    println!("{unchanged} unchanged");
    Ok(())
}
