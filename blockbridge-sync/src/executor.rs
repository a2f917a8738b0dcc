//! The sync executor.
//!
//! Every run takes the document's lease, works out what changed, records
//! the changes in the sync queue, then drains the document's queue. A
//! failed entry is marked `error` and the drain moves on; only storage
//! failures end a run early.

use blockbridge_core::config::checked_relative;
use blockbridge_core::frontmatter::split_frontmatter;
use blockbridge_core::identity::{assign_child_ids, content_hash, reconcile_ids, KnownBlock};
use blockbridge_core::mapper::{
    document_from_remote, frontmatter_to_remote, from_remote, remote_edited_at, remote_id, to_remote,
};
use blockbridge_core::resolver::{resolve, Side, Versioned};
use blockbridge_core::{
    parse_document, render_document, Block, Config, DbBinding, DocFrontmatter, Document,
    RetryPolicy,
};
use blockbridge_store::{
    bindings, documents, mappings, queue, variables, BlockMapping, NewEntry, NewMapping, Store, StoreError,
    SyncQueueEntry,
};
use blockbridge_types::{BlockId, ChangeType, QueueStatus, SyncDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{fetch_tree, inline_children, payload_children, update_body, ClientError, ClientResult, RemoteClient};
use crate::locks::{LockTable, SyncLease, SyncPhase};
use crate::merge::{frontmatter_hash, merge_frontmatter, merge_pull, FrontmatterSide, Origin};
use crate::SyncError;

/// Local id reserved for the page's frontmatter block.
pub const FRONTMATTER_ID: &str = "frontmatter";

/// How many preceding blocks an insert remembers as placement anchors.
const ANCHOR_CANDIDATES: usize = 16;

/// What a queue entry asks for, stored as its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// A local block to create or update remotely
    Block {
        remote_document_id: String,
        block: Block,
        position: usize,
        /// Local ids of the blocks before this one, nearest first
        #[serde(default)]
        preceding: Vec<String>,
        modified_at: DateTime<Utc>,
    },
    /// A remote block to delete
    Removal {
        remote_document_id: String,
        remote_block_id: String,
    },
    /// The document's frontmatter
    Frontmatter {
        remote_document_id: String,
        yaml: String,
        modified_at: DateTime<Utc>,
    },
    /// A webhook notification; the document is refreshed from its page
    RemoteEvent {
        event_type: String,
        #[serde(default)]
        page_id: Option<String>,
    },
    /// A binding whose connection differs on both sides
    BindingConflict { local: DbBinding, remote: DbBinding },
}

impl Change {
    pub fn to_value(&self) -> Result<Value, SyncError> {
        Ok(serde_json::to_value(self)?)
    }

    fn name(&self) -> &'static str {
        match self {
            Change::Block { .. } => "block",
            Change::Removal { .. } => "removal",
            Change::Frontmatter { .. } => "frontmatter",
            Change::RemoteEvent { .. } => "remote_event",
            Change::BindingConflict { .. } => "binding_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub entry_id: i64,
    pub block_key: String,
    pub message: String,
    pub retriable: bool,
}

/// Outcome of one run over one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub local_path: String,
    pub remote_document_id: String,
    pub scanned: usize,
    pub queued: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Decisions opened for a human during this run
    pub conflicts: usize,
    /// Blocks changed on both sides and merged automatically
    pub merged: usize,
    pub malformed: usize,
    pub failures: Vec<EntryFailure>,
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn new(local_path: &str, remote_document_id: &str) -> Self {
        Self {
            local_path: local_path.to_string(),
            remote_document_id: remote_document_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicts == 0 && self.malformed == 0
    }
}

/// Why an entry failed, and whether trying again could help.
#[derive(Debug, Clone)]
struct Failed {
    message: String,
    retriable: bool,
}

impl From<&SyncError> for Failed {
    fn from(err: &SyncError) -> Self {
        let retriable = match err {
            SyncError::Client(e) => e.retriable(),
            _ => false,
        };
        Self {
            message: err.to_string(),
            retriable,
        }
    }
}

/// A local block to replace once the drain is done: the hash of the
/// local version that was merged, and the merged block.
type Rewrite = (String, Block);

pub struct Executor {
    store: Arc<Store>,
    client: Arc<dyn RemoteClient>,
    locks: LockTable,
    vault: PathBuf,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Executor {
    pub fn new(store: Arc<Store>, client: Arc<dyn RemoteClient>, vault: impl Into<PathBuf>) -> Self {
        Self {
            store,
            client,
            locks: LockTable::new(),
            vault: vault.into(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(store: Arc<Store>, client: Arc<dyn RemoteClient>, config: &Config) -> Self {
        Self::new(store, client, config.vault_dir())
            .with_retry(config.sync.retry)
            .with_timeout(Duration::from_secs(config.remote.timeout_secs))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upper bound on any single remote call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn vault(&self) -> &Path {
        &self.vault
    }

    async fn remote<T>(&self, call: impl Future<Output = ClientResult<T>>) -> ClientResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(ClientError::Timeout(self.timeout)))
    }

    fn file_for(&self, local_path: &str) -> Result<PathBuf, SyncError> {
        Ok(self.vault.join(checked_relative(local_path)?))
    }

    /// Clean up after an unclean shutdown.
    ///
    /// Entries left in flight fail as retriable, and documents with open
    /// conflicts report `ConflictPending` again.
    pub fn recover(&self) -> Result<usize, SyncError> {
        let interrupted = self.store.write(queue::fail_interrupted)?;
        let conflicts = self
            .store
            .read(|c| queue::with_status(c, QueueStatus::Conflict, None))?;
        for entry in conflicts {
            if let Some(path) = entry.local_path.as_deref() {
                self.locks.mark_conflict_pending(path);
            }
        }
        Ok(interrupted)
    }

    /// Push a local document to a remote page.
    pub async fn sync_to_remote(
        &self,
        local_path: &str,
        remote_document_id: &str,
    ) -> Result<SyncReport, SyncError> {
        let mut lease = self.locks.try_acquire(local_path)?;
        info!(path = local_path, page = remote_document_id, "sync to remote");
        let mut report = SyncReport::new(local_path, remote_document_id);

        let file = self.file_for(local_path)?;
        let (text, modified_at) = read_document(&file).await?.ok_or_else(|| {
            SyncError::io(&file, std::io::Error::new(std::io::ErrorKind::NotFound, "no such document"))
        })?;
        let parsed = parse_document(&text)?;
        for err in &parsed.errors {
            warn!(path = local_path, line = err.line(), error = %err, "skipping malformed block");
            report.warnings.push(err.to_string());
        }
        report.malformed = parsed.errors.len();
        let mut doc = parsed.document;
        report.scanned = doc.blocks.len();

        lease.set_phase(SyncPhase::Diffing);
        let known = self.current_mappings(local_path, remote_document_id)?;
        reconcile_ids(&mut doc.blocks, &known_blocks(&known));
        let entries = diff_local(local_path, remote_document_id, &doc, &known, modified_at, &mut report)?;

        lease.set_phase(SyncPhase::Queuing);
        let moved = moved_blocks(&doc, &known)?;
        let local_bindings = match &doc.frontmatter {
            Some(fm) => fm.bindings(local_path)?,
            None => Vec::new(),
        };
        let frontmatter_queued = entries
            .iter()
            .any(|e| e.local_block_id.as_deref() == Some(FRONTMATTER_ID));
        let now = Utc::now();
        self.store.transaction(|conn| {
            documents::link_document(conn, local_path, remote_document_id, now)?;
            for mapping in &moved {
                mappings::record_mapping(conn, mapping, now)?;
            }
            if !frontmatter_queued {
                for binding in &local_bindings {
                    bindings::upsert(conn, binding, now)?;
                }
            }
            for entry in &entries {
                queue::enqueue(conn, entry, now)?;
            }
            Ok(())
        })?;
        report.queued = entries.len();

        self.drain(&mut lease, &mut report).await?;
        info!(
            path = local_path,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            "sync to remote finished"
        );
        Ok(report)
    }

    /// Pull a remote page into a local document, merging with local edits.
    pub async fn sync_from_remote(
        &self,
        remote_document_id: &str,
        output_path: &str,
    ) -> Result<SyncReport, SyncError> {
        checked_relative(output_path)?;
        let mut lease = self.locks.try_acquire(output_path)?;
        info!(page = remote_document_id, path = output_path, "sync from remote");
        let mut report = SyncReport::new(output_path, remote_document_id);
        self.pull(&lease, remote_document_id, &mut report).await?;
        self.drain(&mut lease, &mut report).await?;
        info!(
            path = output_path,
            inserted = report.inserted,
            updated = report.updated,
            merged = report.merged,
            conflicts = report.conflicts,
            "sync from remote finished"
        );
        Ok(report)
    }

    /// Run only the Applying phase for one document.
    pub async fn apply_pending(&self, local_path: &str) -> Result<SyncReport, SyncError> {
        let mut lease = self.locks.try_acquire(local_path)?;
        let page = self
            .store
            .read(|c| documents::by_path(c, local_path))?
            .map(|link| link.remote_document_id)
            .unwrap_or_default();
        let mut report = SyncReport::new(local_path, &page);
        self.drain(&mut lease, &mut report).await?;
        Ok(report)
    }

    /// Fail remote changes that arrived for pages no document is linked to.
    pub fn fail_unrouted(&self) -> Result<usize, SyncError> {
        let mut failed = 0;
        while let Some(entry) = self.store.write(queue::dequeue_unrouted)? {
            warn!(entry_id = entry.id, remote_id = ?entry.remote_id, "no local document for remote change");
            self.store.write(|c| {
                queue::mark_failed(c, entry.id, "no local document is linked to this remote page", false)
            })?;
            failed += 1;
        }
        Ok(failed)
    }

    /// Settle a binding conflict by picking a side.
    ///
    /// `connection_path` overrides the chosen side's path. The choice is
    /// written into the local frontmatter and pushed to the page.
    pub async fn resolve_conflict(
        &self,
        entry_id: i64,
        choice: Side,
        connection_path: Option<String>,
    ) -> Result<SyncReport, SyncError> {
        let local_path = self
            .store
            .read(|c| queue::get(c, entry_id))?
            .local_path
            .ok_or(SyncError::NotAConflict(entry_id))?;
        let mut lease = self.locks.try_acquire(&local_path)?;
        let open = self
            .store
            .read(|c| queue::with_status(c, QueueStatus::Conflict, Some(&local_path)))?;
        lease.set_conflicts(!open.is_empty());

        // Re-read under the lease; the first read only located the document
        let entry = self.store.read(|c| queue::get(c, entry_id))?;
        if entry.status != QueueStatus::Conflict || entry.local_path.as_deref() != Some(local_path.as_str()) {
            return Err(SyncError::NotAConflict(entry_id));
        }
        let Ok(Change::BindingConflict { local, remote }) = serde_json::from_value(entry.payload.clone()) else {
            return Err(SyncError::NotAConflict(entry_id));
        };
        let page = self
            .store
            .read(|c| documents::by_path(c, &local_path))?
            .map(|link| link.remote_document_id)
            .ok_or_else(|| SyncError::NotLinked(local_path.clone()))?;
        lease.set_phase(SyncPhase::Applying);
        let mut report = SyncReport::new(&local_path, &page);

        let mut chosen = match choice {
            Side::Local => local,
            Side::Remote => remote,
        };
        if let Some(path) = connection_path {
            chosen.connection_path = path;
        }
        info!(
            entry_id,
            path = %local_path,
            namespace = %chosen.namespace,
            connection = %chosen.connection_path,
            "binding conflict resolved"
        );

        let file = self.file_for(&local_path)?;
        let text = match read_document(&file).await? {
            Some((text, _)) => text,
            None => String::new(),
        };
        let (fm, _) = split_frontmatter(&text)?;
        let mut fm = fm.unwrap_or_default();
        fm.set_binding(&chosen)?;
        self.rewrite_frontmatter(&local_path, &fm).await?;

        let fm_id = BlockId::from(FRONTMATTER_ID);
        let has_remote = self
            .store
            .read(|c| mappings::get(c, &local_path, FRONTMATTER_ID))?
            .is_some();
        let change_type = if has_remote {
            ChangeType::Update
        } else {
            ChangeType::Insert
        };
        let now = Utc::now();
        let push = NewEntry::to_remote(
            &local_path,
            &fm_id,
            change_type,
            Change::Frontmatter {
                remote_document_id: page.clone(),
                yaml: fm.to_yaml()?,
                modified_at: now,
            }
            .to_value()?,
        );
        self.store.transaction(|conn| {
            queue::resolve_conflict(conn, entry_id, None)?;
            bindings::upsert(conn, &chosen, now)?;
            queue::enqueue(conn, &push, now)?;
            queue::mark(conn, entry_id, QueueStatus::Success, None, now)?;
            Ok(())
        })?;
        report.queued = 1;

        self.drain(&mut lease, &mut report).await?;
        Ok(report)
    }

    /// Mappings for `local_path` against `remote_document_id`, dropping any
    /// left over from a page the document was linked to before.
    fn current_mappings(
        &self,
        local_path: &str,
        remote_document_id: &str,
    ) -> Result<Vec<BlockMapping>, SyncError> {
        let all = self.store.read(|c| mappings::for_document(c, local_path))?;
        let (current, stale): (Vec<_>, Vec<_>) = all
            .into_iter()
            .partition(|m| m.remote_document_id == remote_document_id);
        if !stale.is_empty() {
            info!(path = local_path, stale = stale.len(), "document moved to another page, forgetting old mappings");
            self.store.transaction(|conn| {
                for m in &stale {
                    mappings::remove_block(conn, local_path, &m.local_block_id)?;
                }
                Ok(())
            })?;
        }
        Ok(current)
    }

    /// Fetch the page and merge it into the local document.
    ///
    /// Writes the merged document, records the remote state as synced and
    /// queues whatever the page still lacks.
    async fn pull(
        &self,
        lease: &SyncLease,
        remote_document_id: &str,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        lease.set_phase(SyncPhase::Scanning);
        let local_path = lease.path().to_string();
        let file = self.file_for(&local_path)?;

        let payloads = self
            .remote(fetch_tree(self.client.as_ref(), remote_document_id))
            .await?;
        let remote = document_from_remote(&payloads);
        for warning in &remote.warnings {
            report.warnings.push(warning.to_string());
        }
        let remote_fm_at = remote
            .frontmatter_remote_id
            .as_deref()
            .and_then(|id| payloads.iter().find(|p| remote_id(p) == Some(id)))
            .and_then(remote_edited_at);
        report.scanned = remote.blocks.len();

        let existing = read_document(&file).await?;
        let mut local = match &existing {
            Some((text, modified_at)) => {
                let parsed = parse_document(text)?;
                if !parsed.errors.is_empty() {
                    report.malformed = parsed.errors.len();
                    for err in &parsed.errors {
                        report.warnings.push(err.to_string());
                    }
                    warn!(path = %local_path, malformed = report.malformed, "leaving document untouched until its malformed blocks are fixed");
                    return Ok(());
                }
                Some((parsed.document, *modified_at))
            }
            None => None,
        };

        lease.set_phase(SyncPhase::Diffing);
        let known = self.current_mappings(&local_path, remote_document_id)?;
        let (fm_mapping, block_mappings): (Vec<_>, Vec<_>) =
            known.into_iter().partition(|m| m.local_block_id == FRONTMATTER_ID);
        let fm_mapping = fm_mapping.into_iter().next();
        if let Some((doc, _)) = &mut local {
            reconcile_ids(&mut doc.blocks, &known_blocks(&block_mappings));
        }
        let local_at = local.as_ref().map_or_else(Utc::now, |(_, at)| *at);

        let merge = merge_pull(
            local.as_ref().map(|(doc, at)| (doc.blocks.as_slice(), *at)),
            &remote.blocks,
            &block_mappings,
        );

        let local_fm = match &local {
            Some((doc, _)) => doc.frontmatter.clone().filter(|fm| !fm.is_empty()),
            None => remote.frontmatter.clone(),
        };
        let stored = self.store.read(|c| bindings::for_document(c, &local_path))?;
        let fm = merge_frontmatter(
            &local_path,
            FrontmatterSide {
                frontmatter: local_fm.as_ref(),
                modified_at: local_at,
            },
            FrontmatterSide {
                frontmatter: remote.frontmatter.as_ref(),
                modified_at: remote_fm_at.unwrap_or(local_at),
            },
            fm_mapping.as_ref().map(|m| m.content_hash.as_str()),
            &stored,
        )?;

        lease.set_phase(SyncPhase::Queuing);
        let document = Document {
            frontmatter: fm.local.clone(),
            blocks: merge.blocks.iter().map(|m| m.block.clone()).collect(),
        };
        let rendered = render_document(&document)?;
        if existing.as_ref().map(|(text, _)| text.as_str()) != Some(rendered.as_str()) {
            write_atomic(&file, &rendered).await?;
            debug!(path = %local_path, "wrote merged document");
        }

        for m in &merge.blocks {
            match m.origin {
                Origin::Unchanged => report.unchanged += 1,
                Origin::Remote => report.updated += 1,
                Origin::NewRemote => report.inserted += 1,
                Origin::Resolved(_) => report.merged += 1,
                Origin::Local | Origin::NewLocal => {}
            }
        }
        report.deleted += merge.dropped;

        // Bindings waiting on a decision stay as they are on both sides
        let mut disputed = self.disputed_namespaces(&local_path)?;
        disputed.extend(fm.conflicts.iter().map(|(l, _)| l.namespace.clone()));

        // What the page still lacks
        let remote_fm_id = remote.frontmatter_remote_id.clone();
        let mut entries = Vec::new();
        let fm_id = BlockId::from(FRONTMATTER_ID);
        let fm_target = fm
            .remote
            .as_ref()
            .filter(|fm| !fm.is_empty() && disputed.is_empty());
        if let Some(target) = fm_target {
            if remote.frontmatter.as_ref() != Some(target) {
                let change = Change::Frontmatter {
                    remote_document_id: remote_document_id.to_string(),
                    yaml: target.to_yaml()?,
                    modified_at: local_at,
                };
                let entry = match &remote_fm_id {
                    Some(rid) => NewEntry::to_remote(&local_path, &fm_id, ChangeType::Update, change.to_value()?)
                        .with_remote_id(rid),
                    None => NewEntry::to_remote(&local_path, &fm_id, ChangeType::Insert, change.to_value()?),
                };
                entries.push(entry);
            }
        }
        let mut preceding: Vec<String> = Vec::new();
        if fm.remote.is_some() {
            preceding.push(FRONTMATTER_ID.to_string());
        }
        for (position, m) in merge.blocks.iter().enumerate() {
            if m.needs_push() {
                let change = Change::Block {
                    remote_document_id: remote_document_id.to_string(),
                    block: m.block.clone(),
                    position,
                    preceding: anchors(&preceding),
                    modified_at: local_at,
                };
                let entry = match &m.remote {
                    Some((rid, _)) => {
                        NewEntry::to_remote(&local_path, &m.block.id, ChangeType::Update, change.to_value()?)
                            .with_remote_id(rid)
                    }
                    None => NewEntry::to_remote(&local_path, &m.block.id, ChangeType::Insert, change.to_value()?),
                };
                entries.push(entry);
            }
            preceding.push(m.block.id.to_string());
        }
        for (id, rid) in &merge.removals {
            entries.push(removal_entry(&local_path, remote_document_id, id, rid)?);
        }

        let mut records = Vec::new();
        for (position, m) in merge.blocks.iter().enumerate() {
            if let Some((rid, remote_block)) = &m.remote {
                records.push((
                    NewMapping::for_block(&local_path, remote_document_id, rid, remote_block, position)?,
                    declared(&m.block),
                ));
            }
        }
        let fm_record = match (&remote_fm_id, &remote.frontmatter) {
            (Some(rid), Some(rfm)) => Some(frontmatter_mapping(&local_path, remote_document_id, rid, rfm)?),
            _ => None,
        };

        let now = Utc::now();
        self.store.transaction(|conn| {
            documents::link_document(conn, &local_path, remote_document_id, now)?;
            for id in &merge.forgotten {
                mappings::remove_block(conn, &local_path, id.as_str())?;
            }
            for (mapping, decls) in &records {
                mappings::record_mapping(conn, mapping, now)?;
                variables::upsert_block(conn, &local_path, &mapping.local_block_id, decls, now)?;
            }
            match &fm_record {
                Some(mapping) => {
                    mappings::record_mapping(conn, mapping, now)?;
                }
                None if fm_mapping.is_some() => {
                    mappings::remove_block(conn, &local_path, FRONTMATTER_ID)?;
                }
                None => {}
            }
            for binding in fm.bindings.iter().filter(|b| !disputed.contains(&b.namespace)) {
                bindings::upsert(conn, binding, now)?;
            }
            for entry in &entries {
                queue::enqueue(conn, entry, now)?;
            }
            Ok(())
        })?;
        report.queued += entries.len();
        report.conflicts += self.open_binding_conflicts(&local_path, &fm.conflicts)?;
        Ok(())
    }

    /// Re-pull a linked document after webhook notifications.
    async fn refresh(&self, lease: &SyncLease, report: &mut SyncReport) -> Result<(), SyncError> {
        let local_path = lease.path();
        let link = self
            .store
            .read(|c| documents::by_path(c, local_path))?
            .ok_or_else(|| SyncError::NotLinked(local_path.to_string()))?;
        debug!(path = local_path, page = %link.remote_document_id, "refreshing from remote");
        let result = self.pull(lease, &link.remote_document_id, report).await;
        lease.set_phase(SyncPhase::Applying);
        result
    }

    /// Namespaces of the document's bindings with an open conflict.
    fn disputed_namespaces(&self, local_path: &str) -> Result<HashSet<String>, SyncError> {
        Ok(self
            .store
            .read(|c| queue::with_status(c, QueueStatus::Conflict, Some(local_path)))?
            .into_iter()
            .filter_map(|e| match serde_json::from_value(e.payload) {
                Ok(Change::BindingConflict { local, .. }) => Some(local.namespace),
                _ => None,
            })
            .collect())
    }

    /// Record binding conflicts not already waiting for a decision.
    fn open_binding_conflicts(
        &self,
        local_path: &str,
        conflicts: &[(DbBinding, DbBinding)],
    ) -> Result<usize, SyncError> {
        if conflicts.is_empty() {
            return Ok(0);
        }
        let open = self.disputed_namespaces(local_path)?;
        let fm_id = BlockId::from(FRONTMATTER_ID);
        let mut opened = 0;
        for (local, remote) in conflicts {
            if open.contains(&local.namespace) {
                continue;
            }
            let change = Change::BindingConflict {
                local: local.clone(),
                remote: remote.clone(),
            };
            let entry = NewEntry::to_remote(local_path, &fm_id, ChangeType::Update, change.to_value()?);
            self.store.write(|c| queue::open_conflict(c, &entry, Utc::now()))?;
            opened += 1;
        }
        Ok(opened)
    }

    /// The Applying phase: work through the document's queue in order.
    async fn drain(&self, lease: &mut SyncLease, report: &mut SyncReport) -> Result<(), SyncError> {
        lease.set_phase(SyncPhase::Applying);
        let local_path = lease.path().to_string();
        let mut refreshed: Option<Result<(), Failed>> = None;
        let mut rewrites: Vec<Rewrite> = Vec::new();

        while let Some(entry) = self.store.write(|c| queue::dequeue_next(c, Some(&local_path)))? {
            debug!(entry_id = entry.id, block_key = %entry.block_key, change = entry.change_type.as_str(), "applying");
            let outcome = match entry.direction {
                SyncDirection::FromRemote => {
                    if refreshed.is_none() {
                        let result = self.refresh(lease, report).await;
                        if let Err(SyncError::Store(err)) = result {
                            return self.abort(&entry, err);
                        }
                        refreshed = Some(result.map_err(|e| Failed::from(&e)));
                    }
                    refreshed.clone().unwrap_or(Ok(()))
                }
                SyncDirection::ToRemote => match self.apply(&entry, report, &mut rewrites).await {
                    Err(SyncError::Store(err)) => return self.abort(&entry, err),
                    other => other.map_err(|e| Failed::from(&e)),
                },
            };
            self.settle(&entry, outcome, report)?;
        }

        if !rewrites.is_empty() {
            self.rewrite_blocks(&local_path, &rewrites, report).await?;
        }
        let open = self
            .store
            .read(|c| queue::with_status(c, QueueStatus::Conflict, Some(&local_path)))?;
        lease.set_conflicts(!open.is_empty());
        Ok(())
    }

    fn abort(&self, entry: &SyncQueueEntry, err: StoreError) -> Result<(), SyncError> {
        warn!(entry_id = entry.id, error = %err, "storage failure, stopping this run");
        if let Err(mark_err) = self
            .store
            .write(|c| queue::mark_failed(c, entry.id, &err.to_string(), false))
        {
            warn!(entry_id = entry.id, error = %mark_err, "could not record failure");
        }
        Err(err.into())
    }

    fn settle(
        &self,
        entry: &SyncQueueEntry,
        outcome: Result<(), Failed>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        match outcome {
            Ok(()) => {
                self.store
                    .write(|c| queue::mark(c, entry.id, QueueStatus::Success, None, Utc::now()))?;
            }
            Err(failed) => {
                let retry = self.retry.should_requeue(entry.attempts, failed.retriable);
                let requeue = self.store.write(|c| {
                    queue::mark_failed(c, entry.id, &failed.message, failed.retriable)?;
                    if !retry {
                        return Ok(false);
                    }
                    match queue::requeue(c, entry.id) {
                        Ok(()) => Ok(true),
                        Err(StoreError::Superseded { .. }) => Ok(false),
                        Err(err) => Err(err),
                    }
                })?;
                if requeue {
                    debug!(entry_id = entry.id, attempts = entry.attempts, error = %failed.message, "retrying");
                } else {
                    warn!(
                        entry_id = entry.id,
                        block_key = %entry.block_key,
                        retriable = failed.retriable,
                        error = %failed.message,
                        "queue entry failed"
                    );
                    report.failed += 1;
                    report.failures.push(EntryFailure {
                        entry_id: entry.id,
                        block_key: entry.block_key.clone(),
                        message: failed.message,
                        retriable: failed.retriable,
                    });
                }
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        entry: &SyncQueueEntry,
        report: &mut SyncReport,
        rewrites: &mut Vec<Rewrite>,
    ) -> Result<(), SyncError> {
        let change: Change = serde_json::from_value(entry.payload.clone())?;
        let local_path = entry.local_path.as_deref().unwrap_or_default();
        match (change, entry.change_type) {
            (
                Change::Block {
                    remote_document_id,
                    block,
                    position,
                    preceding,
                    ..
                },
                ChangeType::Insert,
            ) => {
                self.push_insert(local_path, &remote_document_id, &block, position, &preceding)
                    .await?;
                report.inserted += 1;
            }
            (
                Change::Block {
                    remote_document_id,
                    block,
                    position,
                    preceding,
                    modified_at,
                },
                ChangeType::Update,
            ) => {
                let target = Target {
                    local_path,
                    page: &remote_document_id,
                    position,
                    preceding: &preceding,
                };
                self.push_update(&target, block, modified_at, report, rewrites)
                    .await?;
                report.updated += 1;
            }
            (Change::Removal { remote_block_id, .. }, _) => {
                let local_id = entry.local_block_id.as_deref().unwrap_or_default();
                self.push_removal(local_path, local_id, &remote_block_id).await?;
                report.deleted += 1;
            }
            (
                Change::Frontmatter {
                    remote_document_id,
                    yaml,
                    modified_at,
                },
                change_type,
            ) => {
                let fm = DocFrontmatter::from_yaml(&yaml)?;
                self.push_frontmatter(local_path, &remote_document_id, fm, modified_at, change_type, report)
                    .await?;
            }
            (change, change_type) => {
                return Err(SyncError::InvalidPayload {
                    entry_id: entry.id,
                    reason: format!("cannot {} a {} change", change_type.as_str(), change.name()),
                });
            }
        }
        Ok(())
    }

    fn anchor(&self, local_path: &str, preceding: &[String]) -> Result<Option<String>, SyncError> {
        Ok(self.store.read(|c| {
            for id in preceding {
                if let Some(m) = mappings::get(c, local_path, id)? {
                    return Ok(Some(m.remote_block_id));
                }
            }
            Ok(None)
        })?)
    }

    async fn append_one(&self, parent: &str, payload: &Value, after: Option<&str>) -> Result<String, SyncError> {
        let created = self
            .remote(self.client.append_children(parent, std::slice::from_ref(payload), after))
            .await?;
        let id = created
            .first()
            .and_then(remote_id)
            .ok_or_else(|| ClientError::Decode("append returned no block".to_string()))?;
        Ok(id.to_string())
    }

    async fn push_insert(
        &self,
        local_path: &str,
        page: &str,
        block: &Block,
        position: usize,
        preceding: &[String],
    ) -> Result<(), SyncError> {
        let payload = to_remote(block)?;
        let after = self.anchor(local_path, preceding)?;
        if after.is_none() && !preceding.is_empty() {
            debug!(block = %block.id, "no synced predecessor, appending at the end");
        }
        let rid = self.append_one(page, &payload, after.as_deref()).await?;
        self.record_block(local_path, page, &rid, block, position)?;
        debug!(block = %block.id, remote = %rid, "inserted");
        Ok(())
    }

    async fn push_update(
        &self,
        target: &Target<'_>,
        block: Block,
        modified_at: DateTime<Utc>,
        report: &mut SyncReport,
        rewrites: &mut Vec<Rewrite>,
    ) -> Result<(), SyncError> {
        let Target {
            local_path,
            page,
            position,
            preceding,
        } = *target;
        let Some(mapping) = self
            .store
            .read(|c| mappings::get(c, local_path, block.id.as_str()))?
        else {
            return self.push_insert(local_path, page, &block, position, preceding).await;
        };
        let rid = mapping.remote_block_id.clone();

        let mut current = match self.remote(self.client.get_block(&rid)).await {
            Ok(payload) => payload,
            Err(ClientError::NotFound(_)) => {
                info!(block = %block.id, remote = %rid, "remote block is gone, creating it again");
                return self.push_insert(local_path, page, &block, position, preceding).await;
            }
            Err(err) => return Err(err.into()),
        };
        self.remote(inline_children(self.client.as_ref(), &mut current))
            .await?;
        let remote_block = decode(&current).map(|mut b| {
            b.id = block.id.clone();
            assign_child_ids(&mut b);
            b
        });

        let mut merged = block;
        if let Some(theirs) = &remote_block {
            if content_hash(theirs) != mapping.content_hash {
                let remote_at = remote_edited_at(&current).unwrap_or(mapping.last_synced);
                let base = mapping.snapshot_block();
                let result = resolve(
                    Versioned::new(&merged, modified_at),
                    Versioned::new(theirs, remote_at),
                    base.as_ref(),
                );
                info!(
                    path = local_path,
                    block = %merged.id,
                    resolution = result.resolution_kind.as_str(),
                    "block changed on both sides"
                );
                report.merged += 1;
                if !result.merged.semantically_eq(&merged) {
                    rewrites.push((content_hash(&merged), result.merged.clone()));
                }
                merged = result.merged;
            }
        }

        let payload = to_remote(&merged)?;
        if payload.get("type") != current.get("type") {
            // The service cannot change a block's type in place
            let new_rid = self.append_one(page, &payload, Some(&rid)).await?;
            self.record_block(local_path, page, &new_rid, &merged, position)?;
            match self.remote(self.client.delete_block(&rid)).await {
                Ok(()) | Err(ClientError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            debug!(block = %merged.id, old = %rid, new = %new_rid, "replaced remote block");
            return Ok(());
        }

        let up_to_date = remote_block.as_ref().is_some_and(|b| b.semantically_eq(&merged));
        if !up_to_date {
            self.remote(self.client.update_block(&rid, &update_body(&payload)))
                .await?;
            let children_match = remote_block
                .as_ref()
                .is_some_and(|b| same_blocks(&b.children, &merged.children));
            if !children_match {
                self.replace_children(&rid, &payload).await?;
            }
        }
        self.record_block(local_path, page, &rid, &merged, position)?;
        Ok(())
    }

    async fn replace_children(&self, rid: &str, payload: &Value) -> Result<(), SyncError> {
        let existing = self.remote(self.client.list_children(rid)).await?;
        for child in &existing {
            if let Some(id) = remote_id(child) {
                match self.remote(self.client.delete_block(id)).await {
                    Ok(()) | Err(ClientError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        let children = payload_children(payload);
        if !children.is_empty() {
            self.remote(self.client.append_children(rid, &children, None))
                .await?;
        }
        Ok(())
    }

    async fn push_removal(&self, local_path: &str, local_id: &str, rid: &str) -> Result<(), SyncError> {
        match self.remote(self.client.delete_block(rid)).await {
            Ok(()) => {}
            Err(ClientError::NotFound(_)) => debug!(remote = rid, "already deleted remotely"),
            Err(err) => return Err(err.into()),
        }
        self.store
            .write(|c| mappings::remove_block(c, local_path, local_id))?;
        Ok(())
    }

    async fn push_frontmatter(
        &self,
        local_path: &str,
        page: &str,
        local_fm: DocFrontmatter,
        modified_at: DateTime<Utc>,
        change_type: ChangeType,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mapping = self
            .store
            .read(|c| mappings::get(c, local_path, FRONTMATTER_ID))?;
        if change_type == ChangeType::Delete {
            if let Some(m) = mapping {
                self.push_removal(local_path, FRONTMATTER_ID, &m.remote_block_id).await?;
                report.deleted += 1;
            }
            return Ok(());
        }

        let current = match &mapping {
            Some(m) => match self.remote(self.client.get_block(&m.remote_block_id)).await {
                Ok(payload) => Some(payload),
                Err(ClientError::NotFound(_)) => None,
                Err(err) => return Err(err.into()),
            },
            None => None,
        };
        let (Some(mapping), Some(current)) = (mapping, current) else {
            let payload = frontmatter_to_remote(&local_fm)?;
            let rid = self.append_one(page, &payload, None).await?;
            let record = frontmatter_mapping(local_path, page, &rid, &local_fm)?;
            let local_bindings = local_fm.bindings(local_path)?;
            self.store_frontmatter(local_path, &record, &local_bindings)?;
            report.inserted += 1;
            return Ok(());
        };

        let remote_fm = document_from_remote(std::slice::from_ref(&current)).frontmatter;
        let remote_hash = remote_fm.as_ref().map(frontmatter_hash).transpose()?;
        let (to_push, agreed) = if remote_hash.as_deref() != Some(mapping.content_hash.as_str()) {
            let stored = self.store.read(|c| bindings::for_document(c, local_path))?;
            let merge = merge_frontmatter(
                local_path,
                FrontmatterSide {
                    frontmatter: Some(&local_fm),
                    modified_at,
                },
                FrontmatterSide {
                    frontmatter: remote_fm.as_ref(),
                    modified_at: remote_edited_at(&current).unwrap_or(mapping.last_synced),
                },
                Some(&mapping.content_hash),
                &stored,
            )?;
            report.conflicts += self.open_binding_conflicts(local_path, &merge.conflicts)?;
            if let Some(merged_local) = merge.local.as_ref().filter(|fm| **fm != local_fm) {
                self.rewrite_frontmatter(local_path, merged_local).await?;
            }
            report.merged += 1;
            (merge.remote.unwrap_or(local_fm), merge.bindings)
        } else {
            let agreed = local_fm.bindings(local_path)?;
            (local_fm, agreed)
        };

        if remote_fm.as_ref() != Some(&to_push) {
            let payload = frontmatter_to_remote(&to_push)?;
            self.remote(self.client.update_block(&mapping.remote_block_id, &update_body(&payload)))
                .await?;
        }
        let record = frontmatter_mapping(local_path, page, &mapping.remote_block_id, &to_push)?;
        self.store_frontmatter(local_path, &record, &agreed)?;
        report.updated += 1;
        Ok(())
    }

    /// Record the frontmatter mapping and the bindings nobody disputes.
    fn store_frontmatter(
        &self,
        local_path: &str,
        record: &NewMapping,
        agreed: &[DbBinding],
    ) -> Result<(), SyncError> {
        let disputed = self.disputed_namespaces(local_path)?;
        let now = Utc::now();
        self.store.transaction(|conn| {
            mappings::record_mapping(conn, record, now)?;
            for binding in agreed.iter().filter(|b| !disputed.contains(&b.namespace)) {
                bindings::upsert(conn, binding, now)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn record_block(
        &self,
        local_path: &str,
        page: &str,
        rid: &str,
        block: &Block,
        position: usize,
    ) -> Result<(), SyncError> {
        let mapping = NewMapping::for_block(local_path, page, rid, block, position)?;
        let decls = declared(block);
        let now = Utc::now();
        self.store.transaction(|conn| {
            mappings::record_mapping(conn, &mapping, now)?;
            variables::upsert_block(conn, local_path, block.id.as_str(), &decls, now)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Replace the frontmatter of a local file, leaving the body as is.
    async fn rewrite_frontmatter(&self, local_path: &str, fm: &DocFrontmatter) -> Result<(), SyncError> {
        let file = self.file_for(local_path)?;
        let text = read_document(&file)
            .await?
            .map(|(text, _)| text)
            .unwrap_or_default();
        let (existing, body) = split_frontmatter(&text)?;
        let separator = if existing.is_none() && !body.is_empty() {
            "\n"
        } else {
            ""
        };
        let contents = format!("---\n{}---\n{}{}", fm.to_yaml()?, separator, body);
        write_atomic(&file, &contents).await
    }

    /// Write merged blocks back into the local file.
    async fn rewrite_blocks(
        &self,
        local_path: &str,
        rewrites: &[Rewrite],
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let file = self.file_for(local_path)?;
        let Some((text, _)) = read_document(&file).await? else {
            return Ok(());
        };
        let parsed = parse_document(&text)?;
        if !parsed.errors.is_empty() {
            warn!(path = local_path, "merged blocks not written back: document has malformed blocks");
            report
                .warnings
                .push("merged blocks not written back: document has malformed blocks".to_string());
            return Ok(());
        }
        let mut doc = parsed.document;
        let mut pending: Vec<Option<&Rewrite>> = rewrites.iter().map(Some).collect();
        let mut replaced = 0;
        for block in &mut doc.blocks {
            let hash = content_hash(block);
            let slot = pending
                .iter_mut()
                .find(|slot| slot.is_some_and(|(h, _)| *h == hash));
            if let Some(slot) = slot {
                if let Some((_, merged)) = slot.take() {
                    let id = block.id.clone();
                    *block = merged.clone();
                    block.id = id;
                    assign_child_ids(block);
                    replaced += 1;
                }
            }
        }
        if replaced > 0 {
            write_atomic(&file, &render_document(&doc)?).await?;
            debug!(path = local_path, replaced, "wrote merged blocks back");
        }
        Ok(())
    }
}

/// Where a pushed block belongs.
#[derive(Clone, Copy)]
struct Target<'a> {
    local_path: &'a str,
    page: &'a str,
    position: usize,
    preceding: &'a [String],
}

fn known_blocks(mappings: &[BlockMapping]) -> Vec<KnownBlock> {
    mappings
        .iter()
        .filter(|m| m.local_block_id != FRONTMATTER_ID)
        .map(BlockMapping::known_block)
        .collect()
}

fn declared(block: &Block) -> Vec<blockbridge_core::VariableDecl> {
    block
        .runtime_metadata
        .as_ref()
        .map(|m| m.declared_variables())
        .unwrap_or_default()
}

fn anchors(preceding: &[String]) -> Vec<String> {
    preceding.iter().rev().take(ANCHOR_CANDIDATES).cloned().collect()
}

fn same_blocks(a: &[Block], b: &[Block]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.semantically_eq(y))
}

/// Decode a remote payload, keeping unknown captions as passthrough.
fn decode(payload: &Value) -> Option<Block> {
    match from_remote(payload) {
        Ok(block) => Some(block),
        Err(err) => {
            warn!(remote_id = ?remote_id(payload), error = %err, "remote block did not map cleanly");
            err.into_passthrough()
        }
    }
}

fn frontmatter_mapping(
    local_path: &str,
    page: &str,
    rid: &str,
    fm: &DocFrontmatter,
) -> Result<NewMapping, SyncError> {
    let yaml = fm.to_yaml()?;
    Ok(NewMapping {
        local_path: local_path.to_string(),
        local_block_id: FRONTMATTER_ID.to_string(),
        remote_block_id: rid.to_string(),
        remote_document_id: page.to_string(),
        block_kind: FRONTMATTER_ID.to_string(),
        position: 0,
        content_hash: frontmatter_hash(fm)?,
        caption: Some("[TYPE:FRONTMATTER]".to_string()),
        block_metadata: None,
        snapshot: Some(serde_json::json!({ "yaml": yaml })),
    })
}

fn removal_entry(
    local_path: &str,
    page: &str,
    local_id: &BlockId,
    rid: &str,
) -> Result<NewEntry, SyncError> {
    let change = Change::Removal {
        remote_document_id: page.to_string(),
        remote_block_id: rid.to_string(),
    };
    Ok(NewEntry::to_remote(local_path, local_id, ChangeType::Delete, change.to_value()?).with_remote_id(rid))
}

/// Compare a parsed document with its mappings and list the changes.
fn diff_local(
    local_path: &str,
    page: &str,
    doc: &Document,
    known: &[BlockMapping],
    modified_at: DateTime<Utc>,
    report: &mut SyncReport,
) -> Result<Vec<NewEntry>, SyncError> {
    let by_id: HashMap<&str, &BlockMapping> = known
        .iter()
        .map(|m| (m.local_block_id.as_str(), m))
        .collect();
    let mut entries = Vec::new();

    let fm_id = BlockId::from(FRONTMATTER_ID);
    let frontmatter = doc.frontmatter.as_ref().filter(|fm| !fm.is_empty());
    match (frontmatter, by_id.get(FRONTMATTER_ID)) {
        (Some(fm), mapping) => {
            if mapping.is_some_and(|m| frontmatter_hash(fm).is_ok_and(|h| h == m.content_hash)) {
                report.unchanged += 1;
            } else {
                let change = Change::Frontmatter {
                    remote_document_id: page.to_string(),
                    yaml: fm.to_yaml()?,
                    modified_at,
                };
                let entry = match mapping {
                    Some(m) => NewEntry::to_remote(local_path, &fm_id, ChangeType::Update, change.to_value()?)
                        .with_remote_id(&m.remote_block_id),
                    None => NewEntry::to_remote(local_path, &fm_id, ChangeType::Insert, change.to_value()?),
                };
                entries.push(entry);
            }
        }
        (None, Some(m)) => {
            let change = Change::Frontmatter {
                remote_document_id: page.to_string(),
                yaml: String::new(),
                modified_at,
            };
            entries.push(
                NewEntry::to_remote(local_path, &fm_id, ChangeType::Delete, change.to_value()?)
                    .with_remote_id(&m.remote_block_id),
            );
        }
        (None, None) => {}
    }

    let mut preceding: Vec<String> = Vec::new();
    if frontmatter.is_some() {
        preceding.push(FRONTMATTER_ID.to_string());
    }
    for (position, block) in doc.blocks.iter().enumerate() {
        let change_type = match by_id.get(block.id.as_str()) {
            Some(m) if m.content_hash == content_hash(block) => {
                report.unchanged += 1;
                None
            }
            Some(_) => Some(ChangeType::Update),
            None => Some(ChangeType::Insert),
        };
        if let Some(change_type) = change_type {
            let change = Change::Block {
                remote_document_id: page.to_string(),
                block: block.clone(),
                position,
                preceding: anchors(&preceding),
                modified_at,
            };
            let mut entry = NewEntry::to_remote(local_path, &block.id, change_type, change.to_value()?);
            if let Some(m) = by_id.get(block.id.as_str()) {
                entry = entry.with_remote_id(&m.remote_block_id);
            }
            entries.push(entry);
        }
        preceding.push(block.id.to_string());
    }

    let present: HashSet<&str> = doc.blocks.iter().map(|b| b.id.as_str()).collect();
    for m in known {
        if m.local_block_id == FRONTMATTER_ID || present.contains(m.local_block_id.as_str()) {
            continue;
        }
        if report.malformed > 0 {
            warn!(path = local_path, block = %m.local_block_id, "not deleting remote block while the document has malformed blocks");
            report.warnings.push(format!(
                "kept remote block {} because the document has malformed blocks",
                m.remote_block_id
            ));
            continue;
        }
        let id = BlockId::new(m.local_block_id.clone());
        entries.push(removal_entry(local_path, page, &id, &m.remote_block_id)?);
    }
    Ok(entries)
}

/// Unchanged blocks that moved, with their new positions.
fn moved_blocks(doc: &Document, known: &[BlockMapping]) -> Result<Vec<NewMapping>, SyncError> {
    let by_id: HashMap<&str, &BlockMapping> = known
        .iter()
        .map(|m| (m.local_block_id.as_str(), m))
        .collect();
    let mut moved = Vec::new();
    for (position, block) in doc.blocks.iter().enumerate() {
        let Some(m) = by_id.get(block.id.as_str()) else {
            continue;
        };
        if m.position != position && m.content_hash == content_hash(block) {
            moved.push(NewMapping {
                local_path: m.local_path.clone(),
                local_block_id: m.local_block_id.clone(),
                remote_block_id: m.remote_block_id.clone(),
                remote_document_id: m.remote_document_id.clone(),
                block_kind: m.block_kind.clone(),
                position,
                content_hash: m.content_hash.clone(),
                caption: m.caption.clone(),
                block_metadata: m.block_metadata.clone(),
                snapshot: m.snapshot.clone(),
            });
        }
    }
    Ok(moved)
}

async fn read_document(path: &Path) -> Result<Option<(String, DateTime<Utc>)>, SyncError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SyncError::io(path, err)),
    };
    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map_err(|e| SyncError::io(path, e))?;
    Ok(Some((text, DateTime::<Utc>::from(modified))))
}

/// Write through a sibling temp file so readers never see half a document.
async fn write_atomic(path: &Path, contents: &str) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| SyncError::io(&tmp, e))?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SyncError::io(path, err));
    }
    Ok(())
}
