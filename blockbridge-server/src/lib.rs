//! HTTP surface for blockbridge.
//!
//! Hosts the remote service's webhook, the sync trigger API, and the
//! background consumer that applies queued remote changes. The `blockbridge`
//! CLI embeds this crate for its `serve` command.

pub mod auth;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod ratelimit;
pub mod server;

use anyhow::Result;
use blockbridge_core::Config;

pub use config::ServeConfig;
pub use error::ApiError;
pub use server::{router, serve, AppState};

/// Run the daemon with already-parsed flags and a loaded config file.
pub async fn run_with_args(args: cli::ServeArgs, core: Config) -> Result<()> {
    let cfg = ServeConfig::from_args(&args, core)?;
    serve(cfg).await
}
