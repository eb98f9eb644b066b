use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use serde::Deserialize;
use types::access::AuthorizationGrant;
use types::errors::AuthorizationError;
use types::ids::DeviceId;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, or the `token` query
/// parameter for browser websocket clients that cannot set headers.
pub fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.trim().is_empty())
}

/// A caller whose token the identity service has just verified.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub grant: AuthorizationGrant,
    pub token: String,
}

impl AuthenticatedUser {
    /// Check the caller may monitor `device_id`.
    pub fn require_device(&self, state: &AppState, device_id: &DeviceId) -> Result<(), AppError> {
        let required = state.registry.policy().required_for(device_id);
        if self.grant.access_level.satisfies(required) {
            Ok(())
        } else {
            Err(AuthorizationError::InsufficientAccessLevel {
                device_id: device_id.clone(),
                required,
                granted: self.grant.access_level,
            }
            .into())
        }
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthorizationError::MissingToken)?;
        let grant = state.identity.verify(&token).await?;
        Ok(AuthenticatedUser { grant, token })
    }
}
