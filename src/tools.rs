use std::sync::Arc;

use axum::{extract::Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing::BillingService;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::plans::PlanTier;
use crate::tool_sessions::ToolSessionIssuer;

/// A paid action or embedded tool and what it costs to use.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub id: &'static str,
    pub name: &'static str,
    /// Credits per unit.
    pub credit_cost: i64,
    pub min_tier: PlanTier,
    /// Action recorded in the usage log.
    #[serde(skip)]
    pub action: &'static str,
    /// Hosted outside the dashboard and opened in a frame.
    pub embedded: bool,
}

pub const TOOL_CATALOG: &[ToolDefinition] = &[
    ToolDefinition {
        id: "chat",
        name: "AI Chat",
        credit_cost: 1,
        min_tier: PlanTier::Free,
        action: "chat_completion",
        embedded: false,
    },
    ToolDefinition {
        id: "image",
        name: "Image Generation",
        credit_cost: 5,
        min_tier: PlanTier::Starter,
        action: "image_generation",
        embedded: false,
    },
    ToolDefinition {
        id: "code-studio",
        name: "Code Studio",
        credit_cost: 3,
        min_tier: PlanTier::Starter,
        action: "tool_launch",
        embedded: true,
    },
    ToolDefinition {
        id: "research-agent",
        name: "Research Agent",
        credit_cost: 2,
        min_tier: PlanTier::Starter,
        action: "tool_launch",
        embedded: true,
    },
    ToolDefinition {
        id: "video-studio",
        name: "Video Studio",
        credit_cost: 10,
        min_tier: PlanTier::Pro,
        action: "tool_launch",
        embedded: true,
    },
];

pub fn find_tool(id: &str) -> Option<&'static ToolDefinition> {
    TOOL_CATALOG.iter().find(|tool| tool.id == id)
}

/// Where embedded tools are served from.
#[derive(Debug, Clone)]
pub struct ToolLaunchConfig {
    pub base_url: String,
}

impl ToolLaunchConfig {
    pub fn launch_url(&self, tool_id: &str, token: &str) -> String {
        format!(
            "{}/{}?session={}",
            self.base_url.trim_end_matches('/'),
            tool_id,
            token
        )
    }
}

pub async fn list_tools() -> Json<&'static [ToolDefinition]> {
    Json(TOOL_CATALOG)
}

#[derive(Debug, Deserialize)]
pub struct ToolAccessRequest {
    pub tool_id: String,
}

#[derive(Debug, Serialize)]
pub struct ToolAccessResponse {
    pub allowed: bool,
    pub tool_id: String,
    pub credits_charged: i64,
    pub remaining_credits: i64,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub launch_url: Option<String>,
}

/// key: tool-access -> check, debit, issue session
pub async fn request_tool_access(
    Extension(pool): Extension<PgPool>,
    Extension(sessions): Extension<Arc<ToolSessionIssuer>>,
    Extension(launch): Extension<Arc<ToolLaunchConfig>>,
    user: AuthUser,
    Json(payload): Json<ToolAccessRequest>,
) -> AppResult<Json<ToolAccessResponse>> {
    let tool = find_tool(payload.tool_id.trim())
        .ok_or_else(|| AppError::BadRequest(format!("unknown tool `{}`", payload.tool_id)))?;

    let service = BillingService::new(pool);
    let charge = service
        .authorize_and_debit(
            user.user_id,
            user.email.as_deref(),
            tool.id,
            1,
            json!({ "source": "tool_access" }),
        )
        .await?;

    let issued = match sessions.issue(user.user_id, tool.id, charge.usage_id, Utc::now()) {
        Ok(issued) => issued,
        Err(err) => {
            service.refund(user.user_id, charge.usage_id).await?;
            return Err(err.into());
        }
    };

    let launch_url = tool
        .embedded
        .then(|| launch.launch_url(tool.id, &issued.token));

    Ok(Json(ToolAccessResponse {
        allowed: true,
        tool_id: tool.id.to_string(),
        credits_charged: charge.credits_charged,
        remaining_credits: charge.remaining_credits,
        session_token: issued.token,
        expires_at: issued.expires_at,
        launch_url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateSessionRequest {
    pub token: String,
    #[serde(default)]
    pub tool_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    pub user_id: Uuid,
    pub tool_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Called by embedded tools; the session token is the only credential.
pub async fn validate_tool_session(
    Extension(sessions): Extension<Arc<ToolSessionIssuer>>,
    Json(payload): Json<ValidateSessionRequest>,
) -> AppResult<Json<ValidateSessionResponse>> {
    let claims = sessions.validate(payload.token.trim())?;
    if let Some(expected) = payload.tool_id.as_deref() {
        if expected != claims.tool {
            return Err(AppError::Forbidden(format!(
                "session was issued for `{}`",
                claims.tool
            )));
        }
    }
    Ok(Json(ValidateSessionResponse {
        valid: true,
        user_id: claims.sub,
        tool_id: claims.tool.clone(),
        expires_at: claims.expires_at(),
    }))
}
