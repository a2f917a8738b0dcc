//! Parse one markdown file and show the blocks a sync would see.

use anyhow::{bail, Context, Result};
use blockbridge_core::{parse_document, Block, BlockKind, DbBinding};
use serde::Serialize;
use std::path::Path;

use super::{preview, print_json};

#[derive(Serialize)]
struct ParseOutput<'a> {
    bindings: Vec<DbBinding>,
    blocks: &'a [Block],
    errors: Vec<String>,
}

fn label(kind: &BlockKind) -> String {
    match kind {
        BlockKind::Heading { level } => format!("heading{level}"),
        BlockKind::List { ordered: true } => "list(ordered)".to_string(),
        BlockKind::Code {
            language: Some(lang),
        } => format!("code({lang})"),
        BlockKind::Unmapped { remote_type } => format!("unmapped({remote_type})"),
        other => other.tag().to_string(),
    }
}

fn print_block(block: &Block, depth: usize) {
    let mut line = format!(
        "{}{:<14} {}",
        "  ".repeat(depth),
        label(&block.kind),
        preview(&block.content.plain_text(), 60)
    );
    if let Some(meta) = &block.runtime_metadata {
        let vars: Vec<String> = meta
            .declared_variables()
            .iter()
            .map(|v| format!("{}: {}", v.name, v.var_type.as_str()))
            .collect();
        if !vars.is_empty() {
            line.push_str(&format!("  ({})", vars.join(", ")));
        }
    }
    println!("{}", line.trim_end());
    for child in &block.children {
        print_block(child, depth + 1);
    }
}

pub fn parse_file(file: &Path, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parsed = parse_document(&text)?;
    let document_path = file.to_string_lossy();
    let bindings = match &parsed.document.frontmatter {
        Some(fm) => fm.bindings(&document_path)?,
        None => Vec::new(),
    };
    let errors: Vec<String> = parsed.errors.iter().map(|e| e.to_string()).collect();

    if json {
        print_json(&ParseOutput {
            bindings,
            blocks: &parsed.document.blocks,
            errors: errors.clone(),
        })?;
    } else {
        for binding in &bindings {
            println!(
                "binding {} -> {} ({})",
                binding.namespace, binding.connection_path, binding.provider
            );
        }
        for block in &parsed.document.blocks {
            print_block(block, 0);
        }
        for err in &errors {
            eprintln!("error: {err}");
        }
    }

    if !errors.is_empty() {
        bail!("{} malformed block(s) in {}", errors.len(), file.display());
    }
    Ok(())
}
