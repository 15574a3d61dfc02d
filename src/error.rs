use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ai::AiError;
use crate::billing::access::AccessDenial;
use crate::billing::webhook::{SignatureError, WebhookError};
use crate::billing::BillingError;
use crate::tool_sessions::ToolSessionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    TooManyRequests {
        message: String,
        retry_after: Option<u64>,
    },
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Message(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() && !matches!(self, AppError::Message(_)) {
            tracing::error!(?self);
            match status {
                StatusCode::BAD_GATEWAY => "upstream service failed".to_string(),
                StatusCode::SERVICE_UNAVAILABLE => self.to_string(),
                _ => "internal server error".to_string(),
            }
        } else {
            if status.is_server_error() {
                tracing::error!(?self);
            } else {
                tracing::debug!(?self, %status, "request rejected");
            }
            self.to_string()
        };
        let retry_after = match &self {
            AppError::TooManyRequests { retry_after, .. } => *retry_after,
            _ => None,
        };
        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AccessDenial> for AppError {
    fn from(denial: AccessDenial) -> Self {
        match denial {
            AccessDenial::DailyLimitReached { retry_after, .. } => AppError::TooManyRequests {
                message: denial.to_string(),
                retry_after: Some(retry_after),
            },
            other => AppError::Forbidden(other.to_string()),
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Denied(denial) => denial.into(),
            BillingError::UnknownTool(tool) => {
                AppError::BadRequest(format!("unknown tool `{tool}`"))
            }
            BillingError::InvalidQuantity => {
                AppError::BadRequest("requested quantity must be at least 1".into())
            }
            BillingError::Db(err) => AppError::Db(err),
        }
    }
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        AppError::BadRequest(format!("webhook signature verification failed: {err}"))
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<AiError> for AppError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::NotConfigured(what) => AppError::Message(format!("{what} is not configured")),
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

impl From<ToolSessionError> for AppError {
    fn from(err: ToolSessionError) -> Self {
        match err {
            ToolSessionError::Encode(_) => AppError::Message("failed to issue tool session".into()),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(?err, "unhandled error");
        AppError::Message("internal server error".into())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn errors_render_json_bodies() {
        let response = AppError::BadRequest("plan is required".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "plan is required");
    }

    #[tokio::test]
    async fn database_errors_are_not_leaked() {
        let response = AppError::Db(sqlx::Error::RowNotFound).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "internal server error");
    }

    #[tokio::test]
    async fn throttling_sets_retry_after() {
        let response = AppError::TooManyRequests {
            message: "slow down".into(),
            retry_after: Some(12),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }
}
