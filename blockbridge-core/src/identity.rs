//! Block identity: content hashing and id reconciliation.
//!
//! A freshly parsed block gets an id derived from its kind, its content and
//! how many identical blocks precede it. Once a document has been synced the
//! stored mappings are the source of truth, and [`reconcile_ids`] carries the
//! stored ids over so an edited block keeps its identity.

use crate::models::Block;
use blockbridge_types::BlockId;
use std::collections::{HashMap, HashSet};

const ID_LEN: usize = 16;

/// blake3 of the block's id-free canonical form.
pub fn content_hash(block: &Block) -> String {
    blake3::hash(block.canonical().to_string().as_bytes())
        .to_hex()
        .to_string()
}

fn derive_id(kind_tag: &str, hash: &str, occurrence: usize) -> BlockId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind_tag.as_bytes());
    hasher.update(&[0]);
    hasher.update(hash.as_bytes());
    hasher.update(&[0]);
    hasher.update(occurrence.to_string().as_bytes());
    let hex = hasher.finalize().to_hex();
    BlockId::new(&hex.as_str()[..ID_LEN])
}

/// Derive ids for top-level blocks from their content, then number children.
pub fn assign_ids(blocks: &mut [Block]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for block in blocks.iter_mut() {
        let hash = content_hash(block);
        let occurrence = seen.entry(hash.clone()).or_insert(0);
        block.id = derive_id(block.kind.tag(), &hash, *occurrence);
        *occurrence += 1;
        assign_child_ids(block);
    }
}

/// Child ids follow from the parent id and the child's position.
pub fn assign_child_ids(block: &mut Block) {
    let parent = block.id.clone();
    for (index, child) in block.children.iter_mut().enumerate() {
        child.id = parent.child(index);
        assign_child_ids(child);
    }
}

/// What the store remembers about a previously synced block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownBlock {
    pub id: BlockId,
    pub kind_tag: String,
    pub position: usize,
    pub content_hash: String,
}

/// Carry stored ids over to freshly parsed blocks.
///
/// An exact content match keeps its stored id. A block left unmatched that
/// sits at a stored block's position with the same kind inherits that id,
/// so an edit reads as an update rather than a delete plus create.
pub fn reconcile_ids(blocks: &mut [Block], known: &[KnownBlock]) {
    if known.is_empty() {
        return;
    }

    let mut by_hash: HashMap<&str, Vec<&KnownBlock>> = HashMap::new();
    for k in known {
        by_hash.entry(k.content_hash.as_str()).or_default().push(k);
    }
    for candidates in by_hash.values_mut() {
        candidates.sort_by_key(|k| k.position);
        candidates.reverse();
    }

    let mut claimed: HashSet<BlockId> = HashSet::new();
    let mut matched = vec![false; blocks.len()];

    for (i, block) in blocks.iter_mut().enumerate() {
        let hash = content_hash(block);
        let Some(candidates) = by_hash.get_mut(hash.as_str()) else {
            continue;
        };
        if let Some(k) = candidates.pop() {
            block.id = k.id.clone();
            claimed.insert(k.id.clone());
            matched[i] = true;
        }
    }

    let by_position: HashMap<usize, &KnownBlock> = known.iter().map(|k| (k.position, k)).collect();
    for (i, block) in blocks.iter_mut().enumerate() {
        if matched[i] {
            continue;
        }
        if let Some(k) = by_position.get(&i) {
            if k.kind_tag == block.kind.tag() && !claimed.contains(&k.id) {
                tracing::debug!(id = %k.id, position = i, "block edited in place, keeping id");
                block.id = k.id.clone();
                claimed.insert(k.id.clone());
                matched[i] = true;
            }
        }
    }

    let known_ids: HashSet<&BlockId> = known.iter().map(|k| &k.id).collect();
    for (i, block) in blocks.iter_mut().enumerate() {
        if !matched[i] {
            let base = block.id.clone();
            let mut suffix = 1;
            while claimed.contains(&block.id) || known_ids.contains(&block.id) {
                block.id = BlockId::new(format!("{}-{}", base, suffix));
                suffix += 1;
            }
            claimed.insert(block.id.clone());
        }
        assign_child_ids(block);
    }
}
