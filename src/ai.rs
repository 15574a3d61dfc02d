use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::billing::BillingService;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

const MAX_PROMPT_CHARS: usize = 4_000;
const MAX_IMAGES: i64 = 4;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream answered {status}: {body}")]
    Upstream { status: u16, body: String },
}

/// key: ai-gateway -> chat router and image API client
pub struct AiGateway {
    client: reqwest::Client,
    router_base_url: String,
    router_api_key: Option<String>,
    default_model: String,
    image_base_url: String,
    image_api_key: Option<String>,
}

impl AiGateway {
    pub fn new(
        router_base_url: impl Into<String>,
        router_api_key: Option<String>,
        default_model: impl Into<String>,
        image_base_url: impl Into<String>,
        image_api_key: Option<String>,
    ) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            router_base_url: router_base_url.into(),
            router_api_key,
            default_model: default_model.into(),
            image_base_url: image_base_url.into(),
            image_api_key,
        })
    }

    fn endpoint(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub fn chat_configured(&self) -> Result<(), AiError> {
        self.router_api_key
            .as_ref()
            .map(|_| ())
            .ok_or(AiError::NotConfigured("chat provider"))
    }

    pub fn image_configured(&self) -> Result<(), AiError> {
        self.image_api_key
            .as_ref()
            .map(|_| ())
            .ok_or(AiError::NotConfigured("image provider"))
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<Value, AiError> {
        let key = self
            .router_api_key
            .as_deref()
            .ok_or(AiError::NotConfigured("chat provider"))?;
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        self.post_json(
            Self::endpoint(&self.router_base_url, "chat/completions"),
            key,
            &body,
        )
        .await
    }

    pub async fn generate_image(&self, prompt: &str, size: &str, n: i64) -> Result<Value, AiError> {
        let key = self
            .image_api_key
            .as_deref()
            .ok_or(AiError::NotConfigured("image provider"))?;
        let body = json!({ "prompt": prompt, "size": size, "n": n });
        self.post_json(
            Self::endpoint(&self.image_base_url, "images/generations"),
            key,
            &body,
        )
        .await
    }

    async fn post_json(&self, url: String, key: &str, body: &Value) -> Result<Value, AiError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub n: Option<i64>,
}

pub(crate) fn validate_image_request(request: &ImageRequest) -> Result<i64, AppError> {
    let chars = request.prompt.trim().chars().count();
    if chars == 0 || chars > MAX_PROMPT_CHARS {
        return Err(AppError::BadRequest(format!(
            "prompt must be between 1 and {MAX_PROMPT_CHARS} characters"
        )));
    }
    let n = request.n.unwrap_or(1);
    if !(1..=MAX_IMAGES).contains(&n) {
        return Err(AppError::BadRequest(format!("n must be between 1 and {MAX_IMAGES}")));
    }
    Ok(n)
}

/// key: ai-proxy-chat -> debit, forward, refund on failure
pub async fn chat_completion(
    Extension(pool): Extension<PgPool>,
    Extension(gateway): Extension<Arc<AiGateway>>,
    user: AuthUser,
    Json(request): Json<ChatRequest>,
) -> AppResult<Json<Value>> {
    if request.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".to_string()));
    }
    gateway.chat_configured()?;

    let service = BillingService::new(pool);
    let charge = service
        .authorize_and_debit(
            user.user_id,
            user.email.as_deref(),
            "chat",
            1,
            json!({ "model": request.model, "messages": request.messages.len() }),
        )
        .await?;

    let upstream = async move { gateway.chat(&request).await };
    forward_or_refund(service, user.user_id, charge.usage_id, "chat", upstream)
        .await
        .map(Json)
}

/// key: ai-proxy-image -> debit per image, forward, refund on failure
pub async fn generate_image(
    Extension(pool): Extension<PgPool>,
    Extension(gateway): Extension<Arc<AiGateway>>,
    user: AuthUser,
    Json(request): Json<ImageRequest>,
) -> AppResult<Json<Value>> {
    let n = validate_image_request(&request)?;
    gateway.image_configured()?;
    let size = request.size.as_deref().unwrap_or("1024x1024");

    let service = BillingService::new(pool);
    let charge = service
        .authorize_and_debit(
            user.user_id,
            user.email.as_deref(),
            "image",
            n,
            json!({ "size": size, "n": n }),
        )
        .await?;

    let size = size.to_string();
    let upstream = async move {
        gateway
            .generate_image(request.prompt.trim(), &size, n)
            .await
    };
    forward_or_refund(service, user.user_id, charge.usage_id, "image", upstream)
        .await
        .map(Json)
}

/// Runs the upstream call on its own task so a client that disconnects mid-call still gets
/// its credits back when the upstream fails.
async fn forward_or_refund<F>(
    service: BillingService,
    user_id: Uuid,
    usage_id: Uuid,
    action: &'static str,
    upstream: F,
) -> AppResult<Value>
where
    F: Future<Output = Result<Value, AiError>> + Send + 'static,
{
    let task = tokio::spawn(async move {
        match upstream.await {
            Ok(body) => Ok::<_, AppError>(body),
            Err(err) => {
                warn!(
                    %user_id,
                    %usage_id,
                    action,
                    error = %err,
                    "upstream failed, refunding"
                );
                service.refund(user_id, usage_id).await?;
                Err(AppError::from(err))
            }
        }
    });
    task.await
        .map_err(|err| AppError::Message(format!("{action} upstream task failed: {err}")))?
}
