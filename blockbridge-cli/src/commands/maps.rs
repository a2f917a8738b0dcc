use anyhow::Result;
use blockbridge_store::mappings;
use std::path::Path;

use super::{load_config, open_store, print_json};

pub fn maps(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let rows = store.read(mappings::list)?;

    if json {
        return print_json(&rows);
    }
    for m in &rows {
        println!(
            "{}#{} -> {} ({}, position {})",
            m.local_path, m.local_block_id, m.remote_block_id, m.block_kind, m.position
        );
    }
    Ok(())
}
