//! In-memory remote service for tests and dry runs.
//!
//! Behaves like the blocks API where the executor cares: ids are assigned on
//! append, listings are shallow with `has_children`, updates bump
//! `last_edited_time`. Failures and slow calls can be injected.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::client::{payload_children, ClientError, ClientResult, RemoteClient};

pub struct FakeRemote {
    state: RwLock<FakeState>,
    failures: Mutex<Vec<Failure>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

#[derive(Default)]
struct FakeState {
    blocks: HashMap<String, Value>,
    /// Ordered child ids per page or block
    children: HashMap<String, Vec<String>>,
    last_stamp: Option<DateTime<Utc>>,
}

struct Failure {
    needle: String,
    error: ClientError,
    remaining: usize,
}

impl FakeState {
    /// Strictly increasing timestamps, so edits always order.
    fn stamp(&mut self) -> String {
        let now = Utc::now();
        let next = match self.last_stamp {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(next);
        next.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn view(&self, id: &str) -> Option<Value> {
        let mut payload = self.blocks.get(id)?.clone();
        let has_children = self.children.get(id).is_some_and(|c| !c.is_empty());
        payload["has_children"] = Value::Bool(has_children);
        Some(payload)
    }

    fn insert(&mut self, parent_id: &str, payload: &Value, index: usize) -> Value {
        let id = uuid::Uuid::new_v4().to_string();
        let stamp = self.stamp();
        let nested = payload_children(payload);

        let mut stored = payload.as_object().cloned().unwrap_or_else(Map::new);
        if let Some(Value::Object(body)) = payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(|t| stored.get_mut(t))
        {
            body.remove("children");
        }
        stored.insert("object".into(), Value::from("block"));
        stored.insert("id".into(), Value::from(id.clone()));
        stored.insert("created_time".into(), Value::from(stamp.clone()));
        stored.insert("last_edited_time".into(), Value::from(stamp));
        stored.insert("parent".into(), serde_json::json!({ "block_id": parent_id }));
        self.blocks.insert(id.clone(), Value::Object(stored));

        let siblings = self.children.entry(parent_id.to_string()).or_default();
        let index = index.min(siblings.len());
        siblings.insert(index, id.clone());
        self.children.entry(id.clone()).or_default();

        for (i, child) in nested.iter().enumerate() {
            self.insert(&id, child, i);
        }
        self.view(&id).unwrap_or(Value::Null)
    }

    fn remove(&mut self, id: &str) {
        if let Some(children) = self.children.remove(id) {
            for child in children {
                self.remove(&child);
            }
        }
        self.blocks.remove(id);
    }

    fn tree(&self, parent_id: &str) -> Vec<Value> {
        self.children
            .get(parent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        let mut payload = self.view(id)?;
                        let nested = self.tree(id);
                        if !nested.is_empty() {
                            let remote_type = payload.get("type")?.as_str()?.to_string();
                            if let Some(Value::Object(body)) = payload.get_mut(&remote_type) {
                                body.insert("children".into(), Value::Array(nested));
                            }
                        }
                        Some(payload)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FakeState::default()),
            failures: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register an empty page and return its id.
    pub fn create_page(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.state.write().children.insert(id.clone(), Vec::new());
        id
    }

    /// Fail the next `times` calls whose target id or payload contains `needle`.
    pub fn fail_when(&self, needle: impl Into<String>, error: ClientError, times: usize) {
        self.failures.lock().push(Failure {
            needle: needle.into(),
            error,
            remaining: times,
        });
    }

    /// Make every call wait this long first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The page's blocks with children inlined.
    pub fn page_tree(&self, page_id: &str) -> Vec<Value> {
        self.state.read().tree(page_id)
    }

    /// Edit a block the way a remote user would.
    pub fn edit_block(&self, block_id: &str, payload: &Value) -> bool {
        let mut state = self.state.write();
        let stamp = state.stamp();
        let Some(stored) = state.blocks.get_mut(block_id) else {
            return false;
        };
        let Some(remote_type) = payload.get("type").and_then(Value::as_str) else {
            return false;
        };
        let mut body = payload.get(remote_type).cloned().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut body {
            map.remove("children");
        }
        stored["type"] = Value::from(remote_type);
        stored[remote_type] = body;
        stored["last_edited_time"] = Value::from(stamp);
        true
    }

    /// Add a block at the end of a page the way a remote user would.
    pub fn push_block(&self, parent_id: &str, payload: &Value) -> String {
        let mut state = self.state.write();
        let created = state.insert(parent_id, payload, usize::MAX);
        created["id"].as_str().unwrap_or_default().to_string()
    }

    /// Remove a block the way a remote user would.
    pub fn remove_block(&self, block_id: &str) {
        let mut state = self.state.write();
        for siblings in state.children.values_mut() {
            siblings.retain(|id| id != block_id);
        }
        state.remove(block_id);
    }

    async fn enter(&self, target: &str, payload: Option<&Value>) -> ClientResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.failures.lock();
        let body = payload.map(Value::to_string).unwrap_or_default();
        if let Some(i) = failures
            .iter()
            .position(|f| target.contains(&f.needle) || body.contains(&f.needle))
        {
            let error = failures[i].error.clone();
            failures[i].remaining -= 1;
            if failures[i].remaining == 0 {
                failures.remove(i);
            }
            debug!(target, %error, "injected remote failure");
            return Err(error);
        }
        Ok(())
    }
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list_children(&self, parent_id: &str) -> ClientResult<Vec<Value>> {
        self.enter(parent_id, None).await?;
        let state = self.state.read();
        let ids = state
            .children
            .get(parent_id)
            .ok_or_else(|| ClientError::NotFound(parent_id.to_string()))?;
        Ok(ids.iter().filter_map(|id| state.view(id)).collect())
    }

    async fn get_block(&self, block_id: &str) -> ClientResult<Value> {
        self.enter(block_id, None).await?;
        self.state
            .read()
            .view(block_id)
            .ok_or_else(|| ClientError::NotFound(block_id.to_string()))
    }

    async fn append_children(
        &self,
        parent_id: &str,
        children: &[Value],
        after: Option<&str>,
    ) -> ClientResult<Vec<Value>> {
        let batch = Value::Array(children.to_vec());
        self.enter(parent_id, Some(&batch)).await?;
        let mut state = self.state.write();
        let siblings = state
            .children
            .get(parent_id)
            .ok_or_else(|| ClientError::NotFound(parent_id.to_string()))?;
        let mut index = match after {
            Some(anchor) => siblings
                .iter()
                .position(|id| id == anchor)
                .map(|i| i + 1)
                .ok_or_else(|| ClientError::Status {
                    status: 400,
                    message: format!("`after` block {anchor} is not a child of {parent_id}"),
                })?,
            None => siblings.len(),
        };
        let mut created = Vec::with_capacity(children.len());
        for child in children {
            created.push(state.insert(parent_id, child, index));
            index += 1;
        }
        Ok(created)
    }

    async fn update_block(&self, block_id: &str, payload: &Value) -> ClientResult<Value> {
        self.enter(block_id, Some(payload)).await?;
        let mut state = self.state.write();
        let stamp = state.stamp();
        let stored = state
            .blocks
            .get_mut(block_id)
            .ok_or_else(|| ClientError::NotFound(block_id.to_string()))?;
        let stored_type = stored
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let new_type = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| payload.as_object().and_then(|m| m.keys().next().cloned()))
            .unwrap_or_default();
        if new_type != stored_type {
            return Err(ClientError::Status {
                status: 400,
                message: format!("cannot change block type from {stored_type} to {new_type}"),
            });
        }
        let mut body = payload.get(&new_type).cloned().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut body {
            map.remove("children");
        }
        stored[new_type.as_str()] = body;
        stored["last_edited_time"] = Value::from(stamp);
        state
            .view(block_id)
            .ok_or_else(|| ClientError::NotFound(block_id.to_string()))
    }

    async fn delete_block(&self, block_id: &str) -> ClientResult<()> {
        self.enter(block_id, None).await?;
        let mut state = self.state.write();
        if !state.blocks.contains_key(block_id) {
            return Err(ClientError::NotFound(block_id.to_string()));
        }
        for siblings in state.children.values_mut() {
            siblings.retain(|id| id != block_id);
        }
        state.remove(block_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paragraph(text: &str) -> Value {
        json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": { "rich_text": [{ "type": "text", "text": { "content": text }, "plain_text": text }] }
        })
    }

    #[tokio::test]
    async fn test_append_after_anchor() {
        let remote = FakeRemote::new();
        let page = remote.create_page();
        let first = remote.append_children(&page, &[paragraph("a"), paragraph("c")], None).await.unwrap();
        let a = first[0]["id"].as_str().unwrap().to_string();
        remote.append_children(&page, &[paragraph("b")], Some(&a)).await.unwrap();

        let texts: Vec<String> = remote
            .list_children(&page)
            .await
            .unwrap()
            .iter()
            .map(|b| b["paragraph"]["rich_text"][0]["plain_text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_nested_children_are_listed_shallow() {
        let remote = FakeRemote::new();
        let page = remote.create_page();
        let mut parent = paragraph("parent");
        parent["paragraph"]["children"] = json!([paragraph("child")]);
        let created = remote.append_children(&page, &[parent], None).await.unwrap();

        assert_eq!(created[0]["has_children"], true);
        assert!(created[0]["paragraph"].get("children").is_none());
        let id = created[0]["id"].as_str().unwrap();
        assert_eq!(remote.list_children(id).await.unwrap().len(), 1);
        assert_eq!(remote.page_tree(&page)[0]["paragraph"]["children"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_bumps_edit_time_and_rejects_type_change() {
        let remote = FakeRemote::new();
        let page = remote.create_page();
        let created = remote.append_children(&page, &[paragraph("a")], None).await.unwrap();
        let id = created[0]["id"].as_str().unwrap();
        let before = created[0]["last_edited_time"].clone();

        let updated = remote.update_block(id, &paragraph("b")).await.unwrap();
        assert_ne!(updated["last_edited_time"], before);

        let err = remote
            .update_block(id, &json!({ "type": "divider", "divider": {} }))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let remote = FakeRemote::new();
        let page = remote.create_page();
        remote.fail_when("boom", ClientError::Transport("reset".into()), 1);

        assert!(remote.append_children(&page, &[paragraph("boom")], None).await.is_err());
        assert!(remote.append_children(&page, &[paragraph("boom")], None).await.is_ok());
        assert_eq!(remote.call_count(), 2);
    }
}
