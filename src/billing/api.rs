use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Query},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;
use url::Url;

use super::adapters::{BillingProviderAdapter, CheckoutRequest};
use super::models::UsageLogEntry;
use super::reconciliation::{apply_event, ReconcileOutcome};
use super::service::BillingService;
use super::webhook::{classify_event, ProviderEvent, SignatureVerifier, SIGNATURE_HEADER};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::plans::{PlanLimits, PlanStatus, PlanTier, PriceCatalog};

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub plan: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

/// Redirects must come back to the dashboard's own origin.
pub(crate) fn resolve_redirect(
    requested: Option<&str>,
    base_url: &str,
    outcome: &str,
) -> Result<String, AppError> {
    let base = Url::parse(base_url)
        .map_err(|err| AppError::Message(format!("APP_BASE_URL is invalid: {err}")))?;
    let Some(requested) = requested.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(format!(
            "{}/dashboard?checkout={outcome}",
            base_url.trim_end_matches('/')
        ));
    };
    let candidate = Url::parse(requested)
        .map_err(|_| AppError::BadRequest(format!("redirect url `{requested}` is invalid")))?;
    if candidate.origin() != base.origin() {
        return Err(AppError::BadRequest(format!(
            "redirect url `{requested}` must stay on {}",
            base.origin().ascii_serialization()
        )));
    }
    Ok(candidate.to_string())
}

/// key: billing-checkout -> hosted checkout session
pub async fn create_checkout(
    Extension(pool): Extension<PgPool>,
    Extension(adapter): Extension<Arc<dyn BillingProviderAdapter>>,
    Extension(prices): Extension<Arc<PriceCatalog>>,
    user: AuthUser,
    Json(body): Json<CheckoutBody>,
) -> AppResult<Json<CheckoutResponse>> {
    let tier: PlanTier = body
        .plan
        .parse()
        .map_err(|err: crate::plans::UnknownPlan| AppError::BadRequest(err.to_string()))?;
    if !tier.is_paid() {
        return Err(AppError::BadRequest(format!("plan `{tier}` cannot be purchased")));
    }
    let price_id = prices
        .price_for(tier)
        .ok_or_else(|| AppError::Message(format!("no price is configured for plan `{tier}`")))?
        .to_string();

    let success_url =
        resolve_redirect(body.success_url.as_deref(), &config::APP_BASE_URL, "success")?;
    let cancel_url =
        resolve_redirect(body.cancel_url.as_deref(), &config::APP_BASE_URL, "cancel")?;

    let service = BillingService::new(pool);
    service
        .ensure_profile(user.user_id, user.email.as_deref())
        .await?;
    let customer_id = service.customer_id(user.user_id).await?;

    let session = adapter
        .create_checkout_session(&CheckoutRequest {
            user_id: user.user_id,
            email: user.email.clone(),
            customer_id,
            tier,
            price_id,
            success_url,
            cancel_url,
        })
        .await
        .map_err(|err| AppError::BadGateway(format!("{err:#}")))?;

    service
        .record_checkout_session(&session.id, user.user_id, tier)
        .await?;
    info!(
        user_id = %user.user_id,
        plan = %tier,
        session_id = %session.id,
        "checkout session created"
    );

    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct PortalBody {
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

pub async fn create_portal(
    Extension(pool): Extension<PgPool>,
    Extension(adapter): Extension<Arc<dyn BillingProviderAdapter>>,
    user: AuthUser,
    body: Option<Json<PortalBody>>,
) -> AppResult<Json<PortalResponse>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let return_url = match body.return_url.as_deref() {
        Some(requested) => resolve_redirect(Some(requested), &config::APP_BASE_URL, "portal")?,
        None => format!("{}/dashboard", config::APP_BASE_URL.trim_end_matches('/')),
    };

    let service = BillingService::new(pool);
    let customer_id = service
        .customer_id(user.user_id)
        .await?
        .ok_or_else(|| AppError::BadRequest("no billing account exists yet".to_string()))?;

    let portal = adapter
        .create_portal_session(&customer_id, &return_url)
        .await
        .map_err(|err| AppError::BadGateway(format!("{err:#}")))?;
    Ok(Json(PortalResponse { url: portal.url }))
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
    pub outcome: ReconcileOutcome,
}

/// key: billing-webhook -> verify, classify, reconcile
pub async fn billing_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(verifier): Extension<Arc<SignatureVerifier>>,
    Extension(prices): Extension<Arc<PriceCatalog>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    verifier.verify(signature, &body, Utc::now())?;

    let event = ProviderEvent::parse(&body)?;
    let classified = classify_event(&event, &prices)?;
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("malformed event: {err}")))?;

    let outcome = apply_event(
        &pool,
        &event.id,
        &event.event_type,
        &payload,
        &classified,
        event.created_at(),
    )
    .await?;
    Ok(Json(WebhookAck {
        received: true,
        duplicate: outcome == ReconcileOutcome::Duplicate,
        outcome,
    }))
}

#[derive(Debug, Serialize)]
pub struct PlanSummary {
    pub tier: PlanTier,
    pub status: PlanStatus,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreditSummary {
    pub total: i64,
    pub used: i64,
    pub available: i64,
}

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub plan: PlanSummary,
    pub credits: CreditSummary,
    pub limits: PlanLimits,
    pub actions_today: i64,
}

/// key: billing-dashboard -> plan and balance
pub async fn get_credits(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
) -> AppResult<Json<CreditsResponse>> {
    let service = BillingService::new(pool);
    service
        .ensure_profile(user.user_id, user.email.as_deref())
        .await?;
    let (plan, balance) = service
        .account_snapshot(user.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let actions_today = service.actions_today(user.user_id, Utc::now()).await?;

    let tier = plan.tier();
    Ok(Json(CreditsResponse {
        plan: PlanSummary {
            tier,
            status: plan.status(),
            current_period_end: plan.current_period_end,
        },
        credits: CreditSummary {
            total: balance.total_credits,
            used: balance.used_credits,
            available: balance.available(),
        },
        limits: tier.limits(),
        actions_today,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<i64>,
}

pub async fn list_usage(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Query(query): Query<UsageQuery>,
) -> AppResult<Json<Vec<UsageLogEntry>>> {
    let service = BillingService::new(pool);
    let entries = service
        .recent_usage(user.user_id, query.limit.unwrap_or(20))
        .await?;
    Ok(Json(entries))
}
