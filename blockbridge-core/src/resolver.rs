//! Conflict resolution between diverged local and remote versions.
//!
//! Blocks resolve last-write-wins, ties going to the local side. `state`
//! and `set` blocks with a known last-synced snapshot merge per variable
//! instead. A binding whose connection differs on both sides never
//! auto-resolves.

use crate::frontmatter::DbBinding;
use crate::models::{Assignment, Block, BlockContent, BlockKind, RuntimeMetadata, VariableDecl};
use crate::parser::runtime::metadata_for;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    AutoLastWrite,
    AutoFieldMerge,
    UnresolvedFlag,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::AutoLastWrite => "auto_last_write",
            ResolutionKind::AutoFieldMerge => "auto_field_merge",
            ResolutionKind::UnresolvedFlag => "unresolved_flag",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Side::Local),
            "remote" => Some(Side::Remote),
            _ => None,
        }
    }
}

/// A value with the time it was last modified on its side.
#[derive(Debug, Clone, Copy)]
pub struct Versioned<'a, T> {
    pub value: &'a T,
    pub modified_at: DateTime<Utc>,
}

impl<'a, T> Versioned<'a, T> {
    pub fn new(value: &'a T, modified_at: DateTime<Utc>) -> Self {
        Self { value, modified_at }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult<T> {
    pub merged: T,
    pub resolution_kind: ResolutionKind,
    /// Both candidates, local first, when a human has to choose
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retained: Vec<T>,
}

impl<T: Clone> ResolutionResult<T> {
    pub fn needs_human(&self) -> bool {
        self.resolution_kind == ResolutionKind::UnresolvedFlag
    }

    /// Pick one retained candidate.
    pub fn choose(&self, side: Side) -> Option<T> {
        let index = match side {
            Side::Local => 0,
            Side::Remote => 1,
        };
        self.retained.get(index).cloned()
    }
}

fn newer(local_at: DateTime<Utc>, remote_at: DateTime<Utc>) -> Side {
    if remote_at > local_at {
        Side::Remote
    } else {
        Side::Local
    }
}

/// Resolve a block edited on both sides since `base` was synced.
pub fn resolve(
    local: Versioned<'_, Block>,
    remote: Versioned<'_, Block>,
    base: Option<&Block>,
) -> ResolutionResult<Block> {
    let winner = newer(local.modified_at, remote.modified_at);

    if let Some(merged) = base.and_then(|base| field_merge(local.value, remote.value, base, winner)) {
        return ResolutionResult {
            merged,
            resolution_kind: ResolutionKind::AutoFieldMerge,
            retained: Vec::new(),
        };
    }

    let mut merged = match winner {
        Side::Local => local.value.clone(),
        Side::Remote => remote.value.clone(),
    };
    merged.id = local.value.id.clone();
    crate::identity::assign_child_ids(&mut merged);
    ResolutionResult {
        merged,
        resolution_kind: ResolutionKind::AutoLastWrite,
        retained: Vec::new(),
    }
}

/// Three-way merge of keyed entries.
///
/// An entry changed on one side only takes that side's value; changed on
/// both, `winner` decides. `None` means deleted.
fn merge_keyed<T: Clone + PartialEq>(
    local: &[(String, T)],
    remote: &[(String, T)],
    base: &[(String, T)],
    winner: Side,
) -> Vec<(String, T)> {
    let index = |items: &[(String, T)]| -> HashMap<String, T> { items.iter().cloned().collect() };
    let (l, r, b) = (index(local), index(remote), index(base));

    let mut keys: Vec<&String> = local.iter().map(|(k, _)| k).collect();
    for (k, _) in remote {
        if !l.contains_key(k) {
            keys.push(k);
        }
    }

    let mut merged = Vec::with_capacity(keys.len());
    for key in keys {
        let (lv, rv, bv) = (l.get(key), r.get(key), b.get(key));
        let local_changed = lv != bv;
        let remote_changed = rv != bv;
        let pick = match (local_changed, remote_changed) {
            (true, false) | (false, false) => lv,
            (false, true) => rv,
            (true, true) if lv == rv => lv,
            (true, true) => match winner {
                Side::Local => lv,
                Side::Remote => rv,
            },
        };
        if let Some(value) = pick {
            merged.push((key.clone(), value.clone()));
        }
    }
    merged
}

fn state_entries(block: &Block) -> Option<Vec<(String, VariableDecl)>> {
    match &block.runtime_metadata {
        Some(RuntimeMetadata::State { variables }) => {
            Some(variables.iter().map(|v| (v.name.clone(), v.clone())).collect())
        }
        _ => None,
    }
}

/// Assignments keyed by name and occurrence, since a name may repeat.
fn set_entries(block: &Block) -> Option<Vec<(String, Assignment)>> {
    let Some(RuntimeMetadata::Set { assignments }) = &block.runtime_metadata else {
        return None;
    };
    let mut seen: HashMap<&str, usize> = HashMap::new();
    Some(
        assignments
            .iter()
            .map(|a| {
                let n = seen.entry(a.name.as_str()).or_insert(0);
                let key = format!("{}#{}", a.name, n);
                *n += 1;
                (key, a.clone())
            })
            .collect(),
    )
}

fn field_merge(local: &Block, remote: &Block, base: &Block, winner: Side) -> Option<Block> {
    if local.kind != remote.kind || local.kind != base.kind {
        return None;
    }
    let raw = match local.kind {
        BlockKind::State => {
            let merged = merge_keyed(
                &state_entries(local)?,
                &state_entries(remote)?,
                &state_entries(base)?,
                winner,
            );
            if let Some(side) = same_as(&merged, &state_entries(local)?, &state_entries(remote)?) {
                return Some(keep(side, local, remote));
            }
            merged
                .iter()
                .map(|(_, v)| format!("${} = {}", v.name, v.initial_value))
                .collect::<Vec<_>>()
                .join("\n")
        }
        BlockKind::Set => {
            let merged = merge_keyed(
                &set_entries(local)?,
                &set_entries(remote)?,
                &set_entries(base)?,
                winner,
            );
            if let Some(side) = same_as(&merged, &set_entries(local)?, &set_entries(remote)?) {
                return Some(keep(side, local, remote));
            }
            merged
                .iter()
                .map(|(_, a)| format!("${} {} {}", a.name, a.op.symbol(), a.expr))
                .collect::<Vec<_>>()
                .join("\n")
        }
        _ => return None,
    };

    let metadata = metadata_for(&local.kind, &raw).ok()?;
    let mut block = Block::new(local.kind.clone(), BlockContent::Raw(raw)).with_metadata(metadata);
    block.id = local.id.clone();
    Some(block)
}

/// Which side, if either, the merge reproduced exactly.
fn same_as<T: PartialEq>(merged: &[(String, T)], local: &[(String, T)], remote: &[(String, T)]) -> Option<Side> {
    if merged == local {
        Some(Side::Local)
    } else if merged == remote {
        Some(Side::Remote)
    } else {
        None
    }
}

/// Keep one side verbatim, comments and formatting included.
fn keep(side: Side, local: &Block, remote: &Block) -> Block {
    let mut block = match side {
        Side::Local => local.clone(),
        Side::Remote => remote.clone(),
    };
    block.id = local.id.clone();
    block
}

/// Resolve a data binding changed on both sides.
///
/// A differing connection path or provider is never picked automatically:
/// both versions are retained and the result is flagged for a human.
pub fn resolve_binding(
    local: Versioned<'_, DbBinding>,
    remote: Versioned<'_, DbBinding>,
    base: Option<&DbBinding>,
) -> ResolutionResult<DbBinding> {
    let (l, r) = (local.value, remote.value);
    if l.connection_path != r.connection_path || l.provider != r.provider {
        tracing::info!(
            document = %l.document_path,
            namespace = %l.namespace,
            local = %l.connection_path,
            remote = %r.connection_path,
            "binding path conflict needs a decision"
        );
        return ResolutionResult {
            merged: l.clone(),
            resolution_kind: ResolutionKind::UnresolvedFlag,
            retained: vec![l.clone(), r.clone()],
        };
    }

    let as_entries = |b: &DbBinding| -> Vec<(String, ())> {
        b.bind_config.iter().map(|p| (p.clone(), ())).collect()
    };
    let base_entries = base.map(as_entries).unwrap_or_default();
    let winner = newer(local.modified_at, remote.modified_at);
    let merged_paths: Vec<String> = if base.is_some() {
        merge_keyed(&as_entries(l), &as_entries(r), &base_entries, winner)
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    } else {
        let mut union = l.bind_config.clone();
        for path in &r.bind_config {
            if !union.contains(path) {
                union.push(path.clone());
            }
        }
        union
    };

    let mut merged = l.clone();
    merged.bind_config = merged_paths;
    let resolution_kind = if merged == *l && merged.bind_config == r.bind_config {
        ResolutionKind::AutoLastWrite
    } else {
        ResolutionKind::AutoFieldMerge
    };
    ResolutionResult {
        merged,
        resolution_kind,
        retained: Vec::new(),
    }
}
