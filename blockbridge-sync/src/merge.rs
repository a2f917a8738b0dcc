//! Three-way merge of a pulled page with the local document.
//!
//! The stored mappings are the common ancestor: a side whose content hash
//! still matches its mapping has not changed since the last sync.

use blockbridge_core::identity::{assign_child_ids, content_hash};
use blockbridge_core::mapper::RemoteBlock;
use blockbridge_core::resolver::{resolve, resolve_binding, ResolutionKind, Side, Versioned};
use blockbridge_core::{Block, DbBinding, DocFrontmatter, FrontmatterError};
use blockbridge_store::BlockMapping;
use blockbridge_types::BlockId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Where a merged block's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Unchanged,
    /// Changed locally only
    Local,
    /// Changed remotely only
    Remote,
    /// New on the remote page
    NewRemote,
    /// Not on the remote page yet
    NewLocal,
    /// Changed on both sides
    Resolved(ResolutionKind),
}

#[derive(Debug, Clone)]
pub struct MergedBlock {
    pub block: Block,
    /// Remote id and remote version, when the page has this block
    pub remote: Option<(String, Block)>,
    pub origin: Origin,
}

impl MergedBlock {
    /// Whether the remote page lags behind the merged block.
    pub fn needs_push(&self) -> bool {
        match &self.remote {
            Some((_, remote)) => !self.block.semantically_eq(remote),
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct PullMerge {
    pub blocks: Vec<MergedBlock>,
    /// Deleted locally and untouched remotely: `(local id, remote id)`
    pub removals: Vec<(BlockId, String)>,
    /// Mappings whose remote block no longer exists
    pub forgotten: Vec<BlockId>,
    /// Local blocks dropped because the remote side deleted them
    pub dropped: usize,
}

fn unique_id(base: &BlockId, used: &mut HashSet<BlockId>) -> BlockId {
    let mut id = base.clone();
    let mut suffix = 1;
    while used.contains(&id) {
        id = BlockId::new(format!("{}-{}", base, suffix));
        suffix += 1;
    }
    used.insert(id.clone());
    id
}

fn with_id(block: &Block, id: BlockId) -> Block {
    let mut block = block.clone();
    block.id = id;
    assign_child_ids(&mut block);
    block
}

/// Merge `remote` into the local blocks.
///
/// `local` is `None` when there is no local file yet; the page is then
/// taken as is. Blocks follow the remote order, with local-only blocks
/// slotted in after their nearest local predecessor.
pub fn merge_pull(
    local: Option<(&[Block], DateTime<Utc>)>,
    remote: &[RemoteBlock],
    mappings: &[BlockMapping],
) -> PullMerge {
    let (local_blocks, local_at) = match local {
        Some((blocks, at)) => (blocks, at),
        None => (&[][..], Utc::now()),
    };
    let by_remote: HashMap<&str, &BlockMapping> = mappings
        .iter()
        .map(|m| (m.remote_block_id.as_str(), m))
        .collect();
    let by_local: HashMap<&str, &BlockMapping> = mappings
        .iter()
        .map(|m| (m.local_block_id.as_str(), m))
        .collect();
    let local_index: HashMap<&str, usize> = local_blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id.as_str(), i))
        .collect();

    let mut used: HashSet<BlockId> = local_blocks.iter().map(|b| b.id.clone()).collect();
    used.extend(mappings.iter().map(|m| BlockId::new(m.local_block_id.clone())));

    // Unmapped local blocks by content, so a first pull pairs identical blocks
    let mut unmapped_by_hash: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, block) in local_blocks.iter().enumerate().rev() {
        if !by_local.contains_key(block.id.as_str()) {
            unmapped_by_hash.entry(content_hash(block)).or_default().push(i);
        }
    }

    let mut out = PullMerge::default();
    // Merged blocks with the local index they stand in for
    let mut merged: Vec<(MergedBlock, Option<usize>)> = Vec::new();
    let mut taken = vec![false; local_blocks.len()];

    for rb in remote {
        let rid = rb.remote_id.clone();
        let mapping = rid.as_deref().and_then(|r| by_remote.get(r)).copied();

        let Some(m) = mapping else {
            let paired = unmapped_by_hash
                .get_mut(&content_hash(&rb.block))
                .and_then(Vec::pop);
            if let Some(i) = paired {
                taken[i] = true;
                let block = local_blocks[i].clone();
                let remote_block = with_id(&rb.block, block.id.clone());
                merged.push((
                    MergedBlock {
                        block,
                        remote: rid.map(|r| (r, remote_block)),
                        origin: Origin::Unchanged,
                    },
                    Some(i),
                ));
            } else {
                let id = unique_id(&rb.block.id, &mut used);
                let block = with_id(&rb.block, id);
                merged.push((
                    MergedBlock {
                        remote: rid.map(|r| (r, block.clone())),
                        block,
                        origin: Origin::NewRemote,
                    },
                    None,
                ));
            }
            continue;
        };

        let id = BlockId::new(m.local_block_id.clone());
        let remote_block = with_id(&rb.block, id.clone());
        let remote_changed = content_hash(&remote_block) != m.content_hash;
        let remote_entry = rid.map(|r| (r, remote_block.clone()));

        match local_index.get(m.local_block_id.as_str()) {
            Some(&i) => {
                taken[i] = true;
                let lb = &local_blocks[i];
                let local_changed = content_hash(lb) != m.content_hash;
                let (block, origin) = match (local_changed, remote_changed) {
                    (false, false) => (lb.clone(), Origin::Unchanged),
                    (true, false) => (lb.clone(), Origin::Local),
                    (false, true) => (remote_block, Origin::Remote),
                    (true, true) => {
                        let base = m.snapshot_block();
                        let remote_at = rb.edited_at.unwrap_or(m.last_synced);
                        let result = resolve(
                            Versioned::new(lb, local_at),
                            Versioned::new(&remote_block, remote_at),
                            base.as_ref(),
                        );
                        tracing::info!(
                            block = %lb.id,
                            resolution = result.resolution_kind.as_str(),
                            "block changed on both sides"
                        );
                        (result.merged, Origin::Resolved(result.resolution_kind))
                    }
                };
                merged.push((
                    MergedBlock {
                        block,
                        remote: remote_entry,
                        origin,
                    },
                    Some(i),
                ));
            }
            None if local.is_none() || remote_changed => {
                // No local file yet, or edited remotely after a local delete
                merged.push((
                    MergedBlock {
                        block: remote_block,
                        remote: remote_entry,
                        origin: Origin::Remote,
                    },
                    None,
                ));
            }
            None => {
                if let Some((r, _)) = remote_entry {
                    out.removals.push((id, r));
                }
            }
        }
    }

    let remote_ids: HashSet<&str> = remote.iter().filter_map(|r| r.remote_id.as_deref()).collect();
    for m in mappings {
        if !remote_ids.contains(m.remote_block_id.as_str()) {
            out.forgotten.push(BlockId::new(m.local_block_id.clone()));
        }
    }

    for (i, block) in local_blocks.iter().enumerate() {
        if taken[i] {
            continue;
        }
        if let Some(m) = by_local.get(block.id.as_str()) {
            if !remote_ids.contains(m.remote_block_id.as_str()) && content_hash(block) == m.content_hash {
                tracing::debug!(block = %block.id, "deleted remotely");
                out.dropped += 1;
                continue;
            }
        }
        let at = (0..i)
            .rev()
            .find_map(|j| merged.iter().position(|(_, local)| *local == Some(j)))
            .map_or(0, |p| p + 1);
        merged.insert(
            at,
            (
                MergedBlock {
                    block: block.clone(),
                    remote: None,
                    origin: Origin::NewLocal,
                },
                Some(i),
            ),
        );
    }

    out.blocks = merged.into_iter().map(|(m, _)| m).collect();
    out
}

/// blake3 of the frontmatter's YAML form.
pub fn frontmatter_hash(fm: &DocFrontmatter) -> Result<String, FrontmatterError> {
    Ok(blake3::hash(fm.to_yaml()?.as_bytes()).to_hex().to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontmatterMerge {
    pub local: Option<DocFrontmatter>,
    pub remote: Option<DocFrontmatter>,
    /// Bindings both sides now agree on
    pub bindings: Vec<DbBinding>,
    /// `(local, remote)` binding pairs waiting for a decision
    pub conflicts: Vec<(DbBinding, DbBinding)>,
}

/// A frontmatter version and when its side last changed.
#[derive(Debug, Clone, Copy)]
pub struct FrontmatterSide<'a> {
    pub frontmatter: Option<&'a DocFrontmatter>,
    pub modified_at: DateTime<Utc>,
}

/// Merge frontmatter against the hash stored at last sync.
///
/// Keys other than `data:` follow whichever side changed, the newer one
/// when both did. Bindings are reconciled per namespace; a connection that
/// differs on both sides stays as each side has it and is reported in
/// `conflicts`.
pub fn merge_frontmatter(
    document_path: &str,
    local: FrontmatterSide<'_>,
    remote: FrontmatterSide<'_>,
    base_hash: Option<&str>,
    stored: &[DbBinding],
) -> Result<FrontmatterMerge, FrontmatterError> {
    let hash = |fm: Option<&DocFrontmatter>| fm.map(frontmatter_hash).transpose();
    let local_hash = hash(local.frontmatter)?;
    let remote_hash = hash(remote.frontmatter)?;
    // Sides that agree need no merge, whatever the base says
    let local_changed = local_hash.as_deref() != base_hash && local_hash != remote_hash;
    let remote_changed = remote_hash.as_deref() != base_hash && local_hash != remote_hash;

    let bindings_of = |fm: Option<&DocFrontmatter>| -> Result<Vec<DbBinding>, FrontmatterError> {
        fm.map(|fm| fm.bindings(document_path))
            .transpose()
            .map(Option::unwrap_or_default)
    };

    if !remote_changed || !local_changed {
        let winner = if remote_changed { remote } else { local };
        return Ok(FrontmatterMerge {
            local: winner.frontmatter.cloned(),
            remote: winner.frontmatter.cloned(),
            bindings: bindings_of(winner.frontmatter)?,
            conflicts: Vec::new(),
        });
    }

    let newer = if remote.modified_at > local.modified_at {
        Side::Remote
    } else {
        Side::Local
    };
    let base = match newer {
        Side::Local => local.frontmatter.or(remote.frontmatter),
        Side::Remote => remote.frontmatter.or(local.frontmatter),
    };
    let Some(base) = base else {
        return Ok(FrontmatterMerge::default());
    };
    let mut for_local = base.clone();
    let mut for_remote = base.clone();
    let mut merged = FrontmatterMerge::default();

    let mut namespaces: BTreeMap<String, (Option<DbBinding>, Option<DbBinding>)> = BTreeMap::new();
    for b in bindings_of(local.frontmatter)? {
        let key = b.namespace.clone();
        namespaces.entry(key).or_default().0 = Some(b);
    }
    for b in bindings_of(remote.frontmatter)? {
        let key = b.namespace.clone();
        namespaces.entry(key).or_default().1 = Some(b);
    }

    for (namespace, pair) in namespaces {
        match pair {
            (Some(l), Some(r)) if l == r => {
                for_local.set_binding(&l)?;
                for_remote.set_binding(&l)?;
                merged.bindings.push(l);
            }
            (Some(l), Some(r)) => {
                let base = stored.iter().find(|b| b.namespace == namespace);
                let result = resolve_binding(
                    Versioned::new(&l, local.modified_at),
                    Versioned::new(&r, remote.modified_at),
                    base,
                );
                if result.needs_human() {
                    for_local.set_binding(&l)?;
                    for_remote.set_binding(&r)?;
                    merged.conflicts.push((l, r));
                } else {
                    for_local.set_binding(&result.merged)?;
                    for_remote.set_binding(&result.merged)?;
                    merged.bindings.push(result.merged);
                }
            }
            (Some(b), None) | (None, Some(b)) => {
                for_local.set_binding(&b)?;
                for_remote.set_binding(&b)?;
                merged.bindings.push(b);
            }
            (None, None) => {}
        }
    }

    merged.local = Some(for_local);
    merged.remote = Some(for_remote);
    Ok(merged)
}
