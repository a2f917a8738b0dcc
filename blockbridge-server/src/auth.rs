//! Bearer-token authentication for the sync trigger API.
//!
//! Tokens are HS256 JWTs signed with `BLOCKBRIDGE_API_SECRET`. A token grants
//! capabilities and may restrict which document paths it can touch. The
//! webhook endpoint does not use these tokens; it relies on its HMAC.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use glob_match::glob_match;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Key id that `build_keystore` registers the API secret under.
pub const API_KEY_ID: &str = "api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Status, queue and mapping queries
    Read,
    /// Trigger syncs, retry entries, prune the queue
    Sync,
    /// Settle binding conflicts
    Resolve,
}

impl Capability {
    pub fn all() -> Vec<Capability> {
        vec![Capability::Read, Capability::Sync, Capability::Resolve]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Document path globs. None = every document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
    pub capabilities: Vec<Capability>,
    /// Expiry (Unix timestamp)
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl Claims {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn path_allowed(&self, path: &str) -> bool {
        match &self.allowed_paths {
            None => true,
            Some(patterns) => patterns.iter().any(|pattern| glob_match(pattern, path)),
        }
    }

    /// Validate that this token can perform `cap` on `path`.
    pub fn authorize(&self, cap: Capability, path: Option<&str>) -> Result<(), AuthError> {
        if !self.has_capability(cap) {
            return Err(AuthError::MissingCapability(cap));
        }
        if let Some(p) = path {
            if !self.path_allowed(p) {
                return Err(AuthError::PathNotAllowed(p.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("missing capability: {0:?}")]
    MissingCapability(Capability),

    #[error("path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidToken(_)
            | AuthError::Expired
            | AuthError::UnknownKeyId(_) => StatusCode::UNAUTHORIZED,
            AuthError::MissingCapability(_) | AuthError::PathNotAllowed(_) => StatusCode::FORBIDDEN,
            AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        match self {
            AuthError::RateLimited { retry_after_secs } => (
                self.status(),
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (self.status(), body).into_response(),
        }
    }
}

/// Decoding keys by `kid`, so a secret can be rotated without downtime.
#[derive(Clone)]
pub struct KeyStore {
    keys: HashMap<String, DecodingKey>,
    /// Used when a token has no kid header
    default_kid: Option<String>,
    expected_aud: Option<String>,
    /// Clock skew leeway in seconds
    leeway_secs: u64,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            default_kid: None,
            expected_aud: None,
            leeway_secs: 60,
        }
    }

    /// Add a key; the first key added becomes the default.
    pub fn add_key(&mut self, kid: impl Into<String>, secret: impl AsRef<[u8]>) {
        let kid = kid.into();
        if self.default_kid.is_none() {
            self.default_kid = Some(kid.clone());
        }
        self.keys.insert(kid, DecodingKey::from_secret(secret.as_ref()));
    }

    pub fn set_expected_aud(&mut self, aud: impl Into<String>) {
        self.expected_aud = Some(aud.into());
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        // Fail closed if no keys configured
        if self.keys.is_empty() {
            return Err(AuthError::InvalidToken("no keys configured".into()));
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .or_else(|| self.default_kid.clone())
            .ok_or_else(|| AuthError::InvalidToken("no key id and no default key".into()))?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = self.leeway_secs;
        match &self.expected_aud {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                AuthError::InvalidToken("audience mismatch".into())
            }
            _ => AuthError::InvalidToken(e.to_string()),
        })?;
        Ok(data.claims)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// env: BLOCKBRIDGE_API_SECRET
    pub secret: Option<String>,
    pub expected_aud: Option<String>,
    /// Reject requests without a token
    pub require_auth: bool,
}

impl AuthConfig {
    pub fn build_keystore(&self) -> KeyStore {
        let mut store = KeyStore::new();
        if let Some(secret) = &self.secret {
            store.add_key(API_KEY_ID, secret.as_bytes());
        }
        if let Some(aud) = &self.expected_aud {
            store.set_expected_aud(aud);
        }
        store
    }

    pub fn state(&self) -> AuthState {
        AuthState {
            keystore: Arc::new(self.build_keystore()),
            require_auth: self.require_auth,
        }
    }
}

/// Router extension carrying the key store.
#[derive(Clone)]
pub struct AuthState {
    pub keystore: Arc<KeyStore>,
    pub require_auth: bool,
}

/// Claims when a token was presented; `None` on open deployments.
#[derive(Debug, Clone)]
pub struct MaybeClaims(pub Option<Claims>);

impl MaybeClaims {
    /// Enforce `cap` on `path`. Anonymous requests only reach handlers when
    /// auth is not required, so they pass.
    pub fn authorize(&self, cap: Capability, path: Option<&str>) -> Result<(), AuthError> {
        match &self.0 {
            Some(claims) => claims.authorize(cap, path),
            None => Ok(()),
        }
    }

    /// Rate-limit identity.
    pub fn subject(&self) -> &str {
        self.0.as_ref().map_or("anonymous", |c| c.sub.as_str())
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

impl<S> FromRequestParts<S> for MaybeClaims
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(auth_state) = parts.extensions.get::<AuthState>().cloned() else {
            return Ok(MaybeClaims(None));
        };

        let Some(token) = extract_bearer_token(parts) else {
            if auth_state.require_auth {
                return Err(AuthError::MissingToken);
            }
            return Ok(MaybeClaims(None));
        };

        match auth_state.keystore.verify(token) {
            Ok(claims) => Ok(MaybeClaims(Some(claims))),
            Err(e) => {
                warn!(error = %e, "auth failed");
                Err(e)
            }
        }
    }
}

/// Mint a token signed with `secret` under the API key id.
pub fn create_token(
    secret: &[u8],
    sub: &str,
    capabilities: Vec<Capability>,
    allowed_paths: Option<Vec<String>>,
    expires_in_secs: u64,
) -> Result<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
    let claims = Claims {
        sub: sub.to_string(),
        allowed_paths,
        capabilities,
        exp: now + expires_in_secs,
        aud: None,
    };

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(API_KEY_ID.to_string());

    encode(&header, &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| anyhow!("failed to encode token: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_glob_matching() {
        let claims = Claims {
            sub: "editor".into(),
            allowed_paths: Some(vec!["quests/**".into(), "towns/*.md".into()]),
            capabilities: vec![Capability::Sync],
            exp: u64::MAX,
            aud: None,
        };

        assert!(claims.path_allowed("quests/cave.md"));
        assert!(claims.path_allowed("quests/act1/cave.md"));
        assert!(claims.path_allowed("towns/harbor.md"));
        assert!(!claims.path_allowed("towns/north/inn.md"));
        assert!(!claims.path_allowed("notes.md"));
        assert!(matches!(
            claims.authorize(Capability::Sync, Some("notes.md")),
            Err(AuthError::PathNotAllowed(_))
        ));
        assert!(matches!(
            claims.authorize(Capability::Resolve, Some("quests/cave.md")),
            Err(AuthError::MissingCapability(Capability::Resolve))
        ));
    }

    #[test]
    fn test_token_roundtrip() {
        let secret = b"test-secret";
        let token = create_token(secret, "deploy-bot", Capability::all(), None, 3600).unwrap();

        let store = AuthConfig {
            secret: Some("test-secret".into()),
            ..AuthConfig::default()
        }
        .build_keystore();

        let claims = store.verify(&token).unwrap();
        assert_eq!(claims.sub, "deploy-bot");
        assert!(claims.allowed_paths.is_none());
        assert!(claims.has_capability(Capability::Resolve));
    }

    #[test]
    fn test_wrong_secret_and_empty_keystore() {
        let token = create_token(b"one", "bot", vec![Capability::Read], None, 3600).unwrap();

        let mut store = KeyStore::new();
        store.add_key(API_KEY_ID, b"two");
        assert!(matches!(store.verify(&token), Err(AuthError::InvalidToken(_))));

        assert!(matches!(KeyStore::new().verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_audience_checked_when_configured() {
        let token = create_token(b"s", "bot", vec![Capability::Read], None, 3600).unwrap();
        let store = AuthConfig {
            secret: Some("s".into()),
            expected_aud: Some("blockbridge".into()),
            require_auth: true,
        }
        .build_keystore();
        assert!(matches!(store.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::PathNotAllowed("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::RateLimited { retry_after_secs: 2 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
