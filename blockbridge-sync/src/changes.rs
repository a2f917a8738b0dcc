//! Find vault documents that differ from what was last synced.

use blockbridge_core::identity::{content_hash, reconcile_ids};
use blockbridge_core::parse_document;
use blockbridge_store::{documents, mappings, BlockMapping, Store};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::executor::FRONTMATTER_ID;
use crate::merge::frontmatter_hash;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Never synced
    New,
    Modified,
    Unchanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::New => "new",
            ChangeKind::Modified => "modified",
            ChangeKind::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalChange {
    pub local_path: String,
    pub kind: ChangeKind,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Classify every markdown file under `vault`, sorted by path.
pub fn detect_local_changes(store: &Store, vault: &Path) -> Result<Vec<LocalChange>, SyncError> {
    let mut changes = Vec::new();
    for entry in WalkDir::new(vault)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(vault).to_path_buf();
            SyncError::io(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some("md")
        {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(vault) else {
            continue;
        };
        let local_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let linked = store.read(|c| documents::by_path(c, &local_path))?;
        let known = store.read(|c| mappings::for_document(c, &local_path))?;
        let kind = if linked.is_none() && known.is_empty() {
            ChangeKind::New
        } else {
            let text = std::fs::read_to_string(entry.path()).map_err(|e| SyncError::io(entry.path(), e))?;
            classify(&text, known)
        };
        debug!(path = %local_path, kind = %kind, "scanned");
        changes.push(LocalChange { local_path, kind });
    }
    changes.sort_by(|a, b| a.local_path.cmp(&b.local_path));
    Ok(changes)
}

fn classify(text: &str, known: Vec<BlockMapping>) -> ChangeKind {
    let Ok(parsed) = parse_document(text) else {
        return ChangeKind::Modified;
    };
    if !parsed.errors.is_empty() {
        return ChangeKind::Modified;
    }
    let mut doc = parsed.document;
    let (fm_mapping, blocks): (Vec<_>, Vec<_>) =
        known.into_iter().partition(|m| m.local_block_id == FRONTMATTER_ID);

    let local_fm = doc
        .frontmatter
        .as_ref()
        .filter(|fm| !fm.is_empty())
        .and_then(|fm| frontmatter_hash(fm).ok());
    if local_fm.as_deref() != fm_mapping.first().map(|m| m.content_hash.as_str()) {
        return ChangeKind::Modified;
    }

    let known_blocks: Vec<_> = blocks.iter().map(BlockMapping::known_block).collect();
    reconcile_ids(&mut doc.blocks, &known_blocks);
    let by_id: HashMap<&str, &BlockMapping> =
        blocks.iter().map(|m| (m.local_block_id.as_str(), m)).collect();
    let all_match = doc.blocks.len() == blocks.len()
        && doc.blocks.iter().all(|b| {
            by_id
                .get(b.id.as_str())
                .is_some_and(|m| m.content_hash == content_hash(b))
        });
    if all_match {
        ChangeKind::Unchanged
    } else {
        ChangeKind::Modified
    }
}
