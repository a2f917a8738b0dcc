//! Webhook ingestion.
//!
//! The handler verifies the signature and appends one queue entry per
//! changed block. Nothing is applied here; the consumer drains the queue.

use blockbridge_store::{documents, mappings, queue, NewEntry, Store, StoreError};
use blockbridge_types::{BlockId, ChangeType};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::Change;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("no webhook secret is configured; deliveries cannot be verified")]
    NoSecret,

    #[error("missing signature header")]
    MissingSignature,

    #[error("signature does not match the request body")]
    InvalidSignature,

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Check an `X-Notion-Signature` header against the raw body.
///
/// The header is `sha256=<hex>` (`Signature=<hex>` is also accepted).
/// Without a secret nothing can be verified, so every request is refused.
pub fn verify_signature(
    secret: Option<&str>,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), WebhookError> {
    let secret = secret.ok_or(WebhookError::NoSecret)?;
    let header = header.ok_or(WebhookError::MissingSignature)?.trim();
    let hex_digest = header
        .strip_prefix("sha256=")
        .or_else(|| header.strip_prefix("Signature="))
        .unwrap_or(header);
    let expected = hex::decode(hex_digest).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Signature header value for `body`, as the service would send it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// The body was a subscription handshake
    pub handshake: bool,
    pub queued: usize,
    pub failed: usize,
    pub queue_ids: Vec<i64>,
}

fn change_type_for(event_type: &str) -> Option<ChangeType> {
    match event_type {
        "block.created" | "block.create" | "page.created" => Some(ChangeType::Insert),
        "block.changed" | "block.update" | "block.updated" => Some(ChangeType::Update),
        "block.deleted" | "block.delete" | "page.deleted" => Some(ChangeType::Delete),
        t if t.starts_with("page.") => Some(ChangeType::Update),
        _ => None,
    }
}

fn entity_id(item: &Value) -> Option<&str> {
    item.pointer("/entity/id")
        .or_else(|| item.get("id"))
        .or_else(|| item.get("block_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn parent_page(item: &Value) -> Option<&str> {
    item.pointer("/data/parent/id")
        .or_else(|| item.pointer("/parent/page_id"))
        .or_else(|| item.get("page_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Queue the changes an event describes.
pub fn ingest(store: &Store, body: &Value) -> Result<IngestReport, WebhookError> {
    if body.get("verification_token").is_some() {
        info!("webhook subscription handshake");
        return Ok(IngestReport {
            handshake: true,
            ..IngestReport::default()
        });
    }

    let event_type = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::InvalidPayload("missing `type`".to_string()))?;
    let default_change = change_type_for(event_type)
        .ok_or_else(|| WebhookError::InvalidPayload(format!("unsupported event type `{event_type}`")))?;
    let is_page_event = event_type.starts_with("page.");

    let items: Vec<&Value> = match body.get("changes").and_then(Value::as_array) {
        Some(changes) => changes.iter().collect(),
        None => vec![body],
    };

    let mut report = IngestReport::default();
    let now = Utc::now();
    for item in items {
        let Some(rid) = entity_id(item) else {
            warn!(event = event_type, "webhook item without an id");
            report.failed += 1;
            continue;
        };
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or(event_type);
        let change_type = change_type_for(item_type).unwrap_or(default_change);
        let page = if is_page_event {
            Some(rid)
        } else {
            parent_page(item).or_else(|| parent_page(body))
        };

        let entry = store.transaction(|conn| {
            let mapped = mappings::by_remote(conn, rid)?;
            let linked = match page {
                Some(page) => documents::by_remote(conn, page)?,
                None => None,
            };
            let local_path = linked
                .as_ref()
                .map(|d| d.local_path.clone())
                .or_else(|| mapped.as_ref().map(|m| m.local_path.clone()));
            let page_id = page
                .map(str::to_string)
                .or_else(|| mapped.as_ref().map(|m| m.remote_document_id.clone()));
            let change = Change::RemoteEvent {
                event_type: item_type.to_string(),
                page_id,
            };
            let payload = serde_json::to_value(&change)?;
            let mut entry = NewEntry::from_remote(local_path.as_deref(), rid, change_type, payload);
            if let Some(m) = &mapped {
                entry = entry.with_local_block(&m.local_path, &BlockId::new(m.local_block_id.clone()));
            }
            let id = queue::enqueue(conn, &entry, now)?;
            Ok((id, entry.local_path))
        })?;
        let (id, local_path) = entry;
        match &local_path {
            Some(path) => debug!(entry_id = id, remote_id = rid, path = %path, "queued remote change"),
            None => warn!(entry_id = id, remote_id = rid, "queued remote change for an unlinked page"),
        }
        report.queued += 1;
        report.queue_ids.push(id);
    }
    info!(event = event_type, queued = report.queued, failed = report.failed, "webhook ingested");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockbridge_store::documents::link_document;
    use blockbridge_types::{QueueStatus, SyncDirection};
    use serde_json::json;

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"type":"block.changed"}"#;
        let header = sign("s3cret", body).unwrap();
        assert!(verify_signature(Some("s3cret"), Some(&header), body).is_ok());

        let alt = header.replace("sha256=", "Signature=");
        assert!(verify_signature(Some("s3cret"), Some(&alt), body).is_ok());
    }

    #[test]
    fn test_signature_rejections() {
        let body = b"{}";
        let header = sign("s3cret", body).unwrap();
        assert!(matches!(
            verify_signature(Some("other"), Some(&header), body),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature(Some("s3cret"), None, body),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_signature(Some("s3cret"), Some("sha256=zz"), body),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(verify_signature(None, None, body), Err(WebhookError::NoSecret)));
        assert!(matches!(
            verify_signature(None, Some(&header), body),
            Err(WebhookError::NoSecret)
        ));
    }

    #[test]
    fn test_handshake_queues_nothing() {
        let store = Store::open_memory().unwrap();
        let report = ingest(&store, &json!({ "verification_token": "abc" })).unwrap();
        assert!(report.handshake);
        assert_eq!(report.queued, 0);
    }

    #[test]
    fn test_event_routes_to_linked_document() {
        let store = Store::open_memory().unwrap();
        store
            .write(|c| link_document(c, "cave.md", "page-1", Utc::now()))
            .unwrap();

        let body = json!({
            "type": "block.changed",
            "entity": { "id": "blk-9", "type": "block" },
            "data": { "parent": { "id": "page-1" } }
        });
        let report = ingest(&store, &body).unwrap();
        assert_eq!(report.queued, 1);

        let entry = store.read(|c| queue::get(c, report.queue_ids[0])).unwrap();
        assert_eq!(entry.local_path.as_deref(), Some("cave.md"));
        assert_eq!(entry.direction, SyncDirection::FromRemote);
        assert_eq!(entry.change_type, ChangeType::Update);
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.block_key, "remote:blk-9");
    }

    #[test]
    fn test_changes_array_counts_items_without_ids() {
        let store = Store::open_memory().unwrap();
        let body = json!({
            "type": "block.update",
            "page_id": "page-x",
            "changes": [
                { "id": "a" },
                { "type": "block.deleted", "id": "b" },
                { "note": "no id" }
            ]
        });
        let report = ingest(&store, &body).unwrap();
        assert_eq!(report.queued, 2);
        assert_eq!(report.failed, 1);

        let deleted = store.read(|c| queue::get(c, report.queue_ids[1])).unwrap();
        assert_eq!(deleted.change_type, ChangeType::Delete);
        assert_eq!(deleted.local_path, None);
    }

    #[test]
    fn test_unsupported_event_type() {
        let store = Store::open_memory().unwrap();
        let err = ingest(&store, &json!({ "type": "comment.created", "id": "c" })).unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
    }
}
