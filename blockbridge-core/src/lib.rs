//! # blockbridge-core
//!
//! Core library for blockbridge, the markdown <-> Notion block sync engine.
//!
//! This crate turns markdown documents into typed blocks, maps blocks to and
//! from remote block payloads, and resolves conflicting edits. It performs
//! no I/O beyond loading configuration.

pub mod config;
pub mod frontmatter;
pub mod identity;
pub mod mapper;
pub mod models;
pub mod parser;
pub mod render;
pub mod resolver;

pub use config::{Config, ConfigError, RetryMode, RetryPolicy};
pub use frontmatter::{DbBinding, DocFrontmatter, FrontmatterError, Provider};
pub use identity::{content_hash, reconcile_ids, KnownBlock};
pub use mapper::{from_remote, to_remote, MapError, RemoteBlock, RemoteDocument};
pub use models::{
    Block, BlockContent, BlockKind, Document, RichText, RuntimeMetadata, VariableDecl,
};
pub use parser::{parse, parse_document, parse_lenient, ParseError, ParsedDocument};
pub use render::{render_blocks, render_document};
pub use resolver::{resolve, resolve_binding, ResolutionKind, ResolutionResult, Side, Versioned};
