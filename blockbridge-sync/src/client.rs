//! The remote document service, as the executor sees it.
//!
//! [`crate::notion::NotionClient`] talks HTTP; [`crate::fake::FakeRemote`]
//! keeps pages in memory so the executor can be tested end to end.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("unexpected remote response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether the same call could succeed later.
    pub fn retriable(&self) -> bool {
        match self {
            ClientError::Timeout(_) | ClientError::Transport(_) => true,
            ClientError::Status { status, .. } => *status == 409 || *status == 429 || *status >= 500,
            ClientError::NotFound(_) | ClientError::Decode(_) => false,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Block-level operations on the remote service.
///
/// Payloads use the Notion block object shape. Listing returns top-level
/// children only, flagged with `has_children`; nested blocks need their own
/// `list_children` call.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// All direct children of a page or block, in order.
    async fn list_children(&self, parent_id: &str) -> ClientResult<Vec<Value>>;

    async fn get_block(&self, block_id: &str) -> ClientResult<Value>;

    /// Append `children` under `parent_id`, after the sibling `after` when
    /// given, otherwise at the end. Returns the created blocks in order.
    async fn append_children(
        &self,
        parent_id: &str,
        children: &[Value],
        after: Option<&str>,
    ) -> ClientResult<Vec<Value>>;

    /// Replace a block's type body. The payload's `children` are ignored.
    async fn update_block(&self, block_id: &str, payload: &Value) -> ClientResult<Value>;

    async fn delete_block(&self, block_id: &str) -> ClientResult<()>;
}

/// Fetch a page's blocks with nested children inlined under each block's
/// type body, the shape the mapper decodes.
pub async fn fetch_tree(client: &dyn RemoteClient, parent_id: &str) -> ClientResult<Vec<Value>> {
    fetch_tree_boxed(client, parent_id).await
}

type BoxedFetch<'a> = Pin<Box<dyn Future<Output = ClientResult<Vec<Value>>> + Send + 'a>>;

// Boxed so the recursion through `inline_children` has a nameable `Send` type.
fn fetch_tree_boxed<'a>(client: &'a dyn RemoteClient, parent_id: &'a str) -> BoxedFetch<'a> {
    Box::pin(async move {
        let mut payloads = client.list_children(parent_id).await?;
        for payload in &mut payloads {
            inline_children(client, payload).await?;
        }
        Ok(payloads)
    })
}

/// Fill in `payload`'s children if the service says it has any.
pub async fn inline_children(client: &dyn RemoteClient, payload: &mut Value) -> ClientResult<()> {
    if !blockbridge_core::mapper::remote_has_children(payload) {
        return Ok(());
    }
    let Some(id) = blockbridge_core::mapper::remote_id(payload).map(str::to_string) else {
        return Ok(());
    };
    let nested: BoxedFetch<'_> = fetch_tree_boxed(client, &id);
    let children = nested.await?;
    let Some(remote_type) = payload.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Ok(());
    };
    if let Some(Value::Object(body)) = payload.get_mut(&remote_type) {
        body.insert("children".to_string(), Value::Array(children));
    }
    Ok(())
}

/// Strip what an update may not carry: server fields and children.
pub fn update_body(payload: &Value) -> Value {
    let Some(remote_type) = payload.get("type").and_then(Value::as_str) else {
        return payload.clone();
    };
    let mut body = payload.get(remote_type).cloned().unwrap_or(Value::Null);
    if let Value::Object(map) = &mut body {
        map.remove("children");
    }
    serde_json::json!({ remote_type: body })
}

/// Children carried in a payload's type body.
pub fn payload_children(payload: &Value) -> Vec<Value> {
    payload
        .get("type")
        .and_then(Value::as_str)
        .and_then(|t| payload.get(t))
        .and_then(|body| body.get("children"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retriable_classification() {
        assert!(ClientError::Timeout(Duration::from_secs(1)).retriable());
        assert!(ClientError::Status { status: 429, message: String::new() }.retriable());
        assert!(ClientError::Status { status: 502, message: String::new() }.retriable());
        assert!(!ClientError::Status { status: 400, message: String::new() }.retriable());
        assert!(!ClientError::NotFound("x".into()).retriable());
    }

    #[test]
    fn test_update_body_drops_children() {
        let payload = json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": { "rich_text": [], "children": [{"type": "divider", "divider": {}}] }
        });
        assert_eq!(update_body(&payload), json!({ "paragraph": { "rich_text": [] } }));
        assert_eq!(payload_children(&payload).len(), 1);
    }
}
