use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use blockbridge_store::StoreError;
use blockbridge_sync::{SyncError, WebhookError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;

/// Every way a handler can fail, mapped onto a status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. } | StoreError::Superseded { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(e) => e.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(e) => store_status(e),
            ApiError::Webhook(e) => match e {
                WebhookError::NoSecret
                | WebhookError::MissingSignature
                | WebhookError::InvalidSignature => {
                    StatusCode::UNAUTHORIZED
                }
                WebhookError::InvalidPayload(_) | WebhookError::Json(_) => StatusCode::BAD_REQUEST,
                WebhookError::Store(e) => store_status(e),
            },
            ApiError::Sync(e) => match e {
                SyncError::SyncInProgress(_) => StatusCode::CONFLICT,
                SyncError::Store(e) => store_status(e),
                SyncError::Config(_) | SyncError::NotAConflict(_) => StatusCode::BAD_REQUEST,
                SyncError::NotLinked(_) | SyncError::UnknownDocument(_) => StatusCode::NOT_FOUND,
                SyncError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                    StatusCode::NOT_FOUND
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Auth(e) = self {
            return e.into_response();
        }
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockbridge_core::ConfigError;
    use blockbridge_types::QueueStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::Sync(SyncError::SyncInProgress("a.md".into())), StatusCode::CONFLICT),
            (ApiError::Store(StoreError::NotFound("queue entry 9".into())), StatusCode::NOT_FOUND),
            (
                ApiError::Store(StoreError::InvalidTransition {
                    id: 1,
                    from: QueueStatus::Pending,
                    to: QueueStatus::Pending,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::Store(StoreError::Superseded { id: 1, newer: 2 }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::Sync(SyncError::Config(ConfigError::InvalidDocumentPath("../x".into()))),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::Webhook(WebhookError::InvalidSignature), StatusCode::UNAUTHORIZED),
            (ApiError::Webhook(WebhookError::NoSecret), StatusCode::UNAUTHORIZED),
            (ApiError::BadRequest("nope".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::Sync(SyncError::Client(blockbridge_sync::ClientError::Transport("down".into()))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }
}
