//! Identity service collaborator
//!
//! Tokens are verified by calling `GET /api/auth/me` with the bearer token on
//! every check. Results are never cached: a revoked token must stop working
//! at the next subscription request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use types::access::{AccessLevel, AuthorizationGrant};
use types::errors::AuthorizationError;
use types::ids::UserId;

/// Verifies bearer tokens and returns the caller's grant.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthorizationGrant, AuthorizationError>;
}

#[derive(Deserialize)]
struct MeResponse {
    user: MeUser,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeUser {
    id: UserId,
    #[serde(alias = "access_level")]
    access_level: AccessLevel,
}

/// HTTP client for the identity service.
pub struct HttpIdentity {
    client: Client,
    base_url: String,
}

impl HttpIdentity {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentity {
    async fn verify(&self, token: &str) -> Result<AuthorizationGrant, AuthorizationError> {
        if token.trim().is_empty() {
            return Err(AuthorizationError::MissingToken);
        }

        let response = self
            .client
            .get(format!("{}/api/auth/me", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthorizationError::IdentityUnavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthorizationError::InvalidToken(format!("{status}: {body}")));
        }
        if status.is_client_error() {
            return Err(AuthorizationError::InvalidToken(status.to_string()));
        }
        if !status.is_success() {
            return Err(AuthorizationError::IdentityUnavailable(status.to_string()));
        }

        let me = response
            .json::<MeResponse>()
            .await
            .map_err(|e| AuthorizationError::IdentityUnavailable(format!("malformed identity response: {e}")))?;

        debug!(user_id = %me.user.id, access_level = %me.user.access_level, "Token verified");
        Ok(AuthorizationGrant {
            user_id: me.user.id,
            access_level: me.user.access_level,
        })
    }
}

/// Fixed token table, for tests and local runs.
///
/// Counts verifications so callers can assert that nothing is cached.
#[derive(Default)]
pub struct StaticIdentity {
    grants: Mutex<HashMap<String, AuthorizationGrant>>,
    verifications: AtomicU64,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant(self, token: &str, user_id: &str, access_level: AccessLevel) -> Self {
        self.grant(token, user_id, access_level);
        self
    }

    pub fn grant(&self, token: &str, user_id: &str, access_level: AccessLevel) {
        self.grants.lock().unwrap_or_else(|e| e.into_inner()).insert(
            token.to_string(),
            AuthorizationGrant {
                user_id: UserId::new(user_id),
                access_level,
            },
        );
    }

    /// Invalidate a token, as if it expired upstream.
    pub fn revoke(&self, token: &str) {
        self.grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentity {
    async fn verify(&self, token: &str) -> Result<AuthorizationGrant, AuthorizationError> {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        if token.trim().is_empty() {
            return Err(AuthorizationError::MissingToken);
        }
        self.grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned()
            .ok_or_else(|| AuthorizationError::InvalidToken("unknown or expired token".to_string()))
    }
}
