use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Deserialize)]
struct Claims {
    sub: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Caller identity taken from an identity-provider session token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

pub(crate) fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Some(token) = authz
            .to_str()
            .ok()
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        {
            return Some(token);
        }
    }
    let cookies = parts.headers.get(axum::http::header::COOKIE)?;
    cookies.to_str().ok()?.split(';').find_map(|c| {
        c.trim()
            .strip_prefix("auth_token=")
            .map(|s| s.to_string())
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token =
            bearer_token(parts).ok_or_else(|| AppError::Unauthorized("Missing token".into()))?;
        let secret = crate::config::AUTH_JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized("Invalid token".into()))?;
        Ok(AuthUser {
            user_id: decoded.claims.sub,
            email: decoded.claims.email,
        })
    }
}
