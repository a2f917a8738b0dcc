//! HTTP client for the Notion blocks API.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::client::{update_body, ClientError, ClientResult, RemoteClient};

/// Most children the service accepts per append call
const APPEND_LIMIT: usize = 100;
const PAGE_SIZE: usize = 100;

pub struct NotionClient {
    http: reqwest::Client,
    api_base: String,
    api_version: String,
    token: String,
}

#[derive(Deserialize)]
struct ListResponse {
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl NotionClient {
    pub fn new(
        api_base: impl Into<String>,
        api_version: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", &self.api_version)
    }

    async fn send(&self, builder: RequestBuilder, target: &str) -> ClientResult<Value> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(Duration::ZERO)
            } else {
                ClientError::Transport(e.to_string())
            }
        })?;
        decode_response(response, target).await
    }
}

async fn decode_response(response: Response, target: &str) -> ClientResult<Value> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(target.to_string()));
    }
    if !status.is_success() {
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteClient for NotionClient {
    async fn list_children(&self, parent_id: &str) -> ClientResult<Vec<Value>> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("page_size", PAGE_SIZE.to_string())];
            if let Some(c) = &cursor {
                query.push(("start_cursor", c.clone()));
            }
            let builder = self
                .request(Method::GET, &format!("/blocks/{parent_id}/children"))
                .query(&query);
            let page: ListResponse = serde_json::from_value(self.send(builder, parent_id).await?)
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            results.extend(page.results);
            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        tracing::debug!(parent = parent_id, count = results.len(), "listed remote children");
        Ok(results)
    }

    async fn get_block(&self, block_id: &str) -> ClientResult<Value> {
        self.send(self.request(Method::GET, &format!("/blocks/{block_id}")), block_id)
            .await
    }

    async fn append_children(
        &self,
        parent_id: &str,
        children: &[Value],
        after: Option<&str>,
    ) -> ClientResult<Vec<Value>> {
        let mut created = Vec::with_capacity(children.len());
        let mut anchor = after.map(str::to_string);
        for batch in children.chunks(APPEND_LIMIT) {
            let mut body = json!({ "children": batch });
            if let Some(a) = &anchor {
                body["after"] = json!(a);
            }
            let builder = self
                .request(Method::PATCH, &format!("/blocks/{parent_id}/children"))
                .json(&body);
            let page: ListResponse = serde_json::from_value(self.send(builder, parent_id).await?)
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            let new_blocks: Vec<Value> = page.results.into_iter().take(batch.len()).collect();
            anchor = new_blocks
                .last()
                .and_then(|b| b.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(anchor);
            created.extend(new_blocks);
        }
        Ok(created)
    }

    async fn update_block(&self, block_id: &str, payload: &Value) -> ClientResult<Value> {
        let builder = self
            .request(Method::PATCH, &format!("/blocks/{block_id}"))
            .json(&update_body(payload));
        self.send(builder, block_id).await
    }

    async fn delete_block(&self, block_id: &str) -> ClientResult<()> {
        self.send(self.request(Method::DELETE, &format!("/blocks/{block_id}")), block_id)
            .await?;
        Ok(())
    }
}
