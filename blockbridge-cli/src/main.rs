//! # blockbridge CLI
//!
//! Command-line interface for syncing a markdown vault with Notion pages.

mod commands;

use blockbridge_server::cli::ServeArgs;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "blockbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "blockbridge.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Credentials for commands that talk to the remote service.
#[derive(Args, Clone)]
pub struct RemoteArgs {
    /// Integration token
    #[arg(long, env = "NOTION_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(Copy, Clone, ValueEnum)]
pub enum Choice {
    Local,
    Remote,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook + sync API server
    Serve {
        #[command(flatten)]
        args: ServeArgs,
    },

    /// Parse a markdown file and list its blocks
    Parse {
        /// Markdown file to parse
        file: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Push a vault document to a remote page
    Push {
        /// Document path relative to the vault
        file: String,

        /// Remote page id
        #[arg(long)]
        page: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Pull a remote page into a vault document
    Pull {
        /// Remote page id
        #[arg(long)]
        page: String,

        /// Document path relative to the vault
        #[arg(long)]
        output: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Queue totals and linked documents
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Most recent queue entries
    Queue {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Block mappings between local and remote blocks
    Maps {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Vault documents that changed since their last sync
    Changes {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Put a failed queue entry back in line
    Retry {
        /// Queue entry id
        id: i64,
    },

    /// Settle a binding conflict
    Resolve {
        /// Queue entry id of the conflict
        id: i64,

        /// Which side's binding to keep
        #[arg(long, value_enum)]
        choice: Choice,

        /// Override the chosen connection path
        #[arg(long)]
        connection_path: Option<String>,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Delete successful queue entries older than the cutoff
    Clear {
        /// Keep entries newer than this many days (defaults to sync.keep_completed_days)
        #[arg(long)]
        keep_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else if matches!(cli.command, Commands::Serve { .. }) {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    // Logs go to stderr so `--json` output stays machine-readable
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve { args } => commands::serve(&cli.config, args).await,
        Commands::Parse { file, json } => commands::parse_file(&file, json),
        Commands::Push { file, page, remote } => {
            commands::push(&cli.config, &file, &page, &remote).await
        }
        Commands::Pull {
            page,
            output,
            remote,
        } => commands::pull(&cli.config, &page, &output, &remote).await,
        Commands::Status { json } => commands::status(&cli.config, json),
        Commands::Queue { limit, json } => commands::queue(&cli.config, limit, json),
        Commands::Maps { json } => commands::maps(&cli.config, json),
        Commands::Changes { json } => commands::changes(&cli.config, json),
        Commands::Retry { id } => commands::retry(&cli.config, id),
        Commands::Resolve {
            id,
            choice,
            connection_path,
            remote,
        } => commands::resolve(&cli.config, id, choice, connection_path, &remote).await,
        Commands::Clear { keep_days } => commands::clear(&cli.config, keep_days),
    }
}
