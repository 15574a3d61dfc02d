use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Claims carried by a tool-session token handed to an embedded tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolSessionClaims {
    pub sub: Uuid,
    pub tool: String,
    pub usage: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
}

impl ToolSessionClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Error)]
pub enum ToolSessionError {
    #[error("tool session expired")]
    Expired,
    #[error("invalid tool session")]
    Invalid,
    #[error("failed to sign tool session: {0}")]
    Encode(jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToolSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and checks the short-lived tokens embedded tools present back to the service.
#[derive(Clone)]
pub struct ToolSessionIssuer {
    secret: String,
    ttl: Duration,
}

impl ToolSessionIssuer {
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    pub fn issue(
        &self,
        user_id: Uuid,
        tool_id: &str,
        usage_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedToolSession, ToolSessionError> {
        let expires_at = now + self.ttl;
        let claims = ToolSessionClaims {
            sub: user_id,
            tool: tool_id.to_string(),
            usage: usage_id,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(ToolSessionError::Encode)?;
        Ok(IssuedToolSession { token, expires_at })
    }

    pub fn validate(&self, token: &str) -> Result<ToolSessionClaims, ToolSessionError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        decode::<ToolSessionClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => ToolSessionError::Expired,
            _ => ToolSessionError::Invalid,
        })
    }
}
