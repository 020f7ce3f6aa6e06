//! Connection authentication at the WebSocket upgrade boundary.
//!
//! Identity resolution is consumed as a single [`Authenticator`] capability
//! with an explicit timeout; a rejected or absent credential refuses the
//! upgrade with 401 before any gateway state exists.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::{HeaderMap, StatusCode, request::Parts};
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::AppState;
use crate::error::AuthError;

/// The authenticated user's opaque identifier.
pub type UserId = String;

/// The identity-resolution collaborator, called once per connection attempt.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Validates the internal HS256 service JWT; the `sub` claim carries the
/// user ID and `exp` is enforced.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| {
                debug!(?err, "jwt validation failed");
                AuthError::InvalidToken
            })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims.sub)
    }
}

/// Extractor that authenticates a WebSocket upgrade request.
///
/// The token is taken from the `Authorization: Bearer` header, falling back
/// to a `token` query parameter for browser clients that cannot set headers
/// on the handshake.
#[derive(Debug)]
pub struct WsAuth(pub UserId);

#[derive(Deserialize)]
struct AuthQuery {
    token: String,
}

impl FromRequestParts<AppState> for WsAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(&parts.headers) {
            Some(token) => Some(token),
            None => Query::<AuthQuery>::from_request_parts(parts, state)
                .await
                .ok()
                .map(|Query(q)| q.token),
        };

        let outcome = match token {
            None => Err(AuthError::MissingToken),
            Some(token) => tokio::time::timeout(
                state.config.auth_timeout,
                state.auth.authenticate(&token),
            )
            .await
            .unwrap_or(Err(AuthError::Timeout)),
        };

        match outcome {
            Ok(user_id) => Ok(WsAuth(user_id)),
            Err(err) => {
                debug!(%err, "websocket upgrade rejected");
                Err(StatusCode::UNAUTHORIZED.into_response())
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer ").map(str::to_owned))
}
