//! CLI command implementations.

pub mod changes;
pub mod maps;
pub mod parse;
pub mod queue;
pub mod sync;

use anyhow::{Context, Result};
use blockbridge_core::Config;
use blockbridge_store::Store;
use std::path::Path;
use std::sync::Arc;

pub use changes::changes;
pub use maps::maps;
pub use parse::parse_file;
pub use queue::{clear, queue, retry, status};
pub use sync::{pull, push, resolve, serve};

/// Load `blockbridge.yml`, or defaults when it does not exist.
pub(crate) fn load_config(config_path: &Path) -> Result<Config> {
    Config::load_or_default(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))
}

pub(crate) fn open_store(config: &Config) -> Result<Arc<Store>> {
    let path = config.database_path();
    let store = Store::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(store))
}

/// First line of `text`, cut to `max` characters.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
