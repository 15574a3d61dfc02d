use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Extension, Router,
};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::ai::{self, AiGateway};
use crate::billing::{self, BillingProviderAdapter, SignatureVerifier};
use crate::health;
use crate::plans::{self, PriceCatalog};
use crate::rate_limit::{rate_limit, RateLimiter};
use crate::tool_sessions::ToolSessionIssuer;
use crate::tools::{self, ToolLaunchConfig};

/// Shared handles injected into every handler.
#[derive(Clone)]
pub struct AppServices {
    pub pool: PgPool,
    pub billing: Arc<dyn BillingProviderAdapter>,
    pub ai: Arc<AiGateway>,
    pub verifier: Arc<SignatureVerifier>,
    pub prices: Arc<PriceCatalog>,
    pub sessions: Arc<ToolSessionIssuer>,
    pub launch: Arc<ToolLaunchConfig>,
    pub limiter: Arc<RateLimiter>,
}

pub fn api_routes(limiter: Arc<RateLimiter>) -> Router {
    let limited = Router::new()
        .route("/api/ai/chat", post(ai::chat_completion))
        .route("/api/ai/image", post(ai::generate_image))
        .route("/api/tools/access", post(tools::request_tool_access))
        .route(
            "/api/tools/session/validate",
            post(tools::validate_tool_session),
        )
        .route("/api/billing/checkout", post(billing::billing_create_checkout))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit));

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/plans", get(plans::list_plans))
        .route("/api/tools", get(tools::list_tools))
        .route("/api/credits", get(billing::billing_get_credits))
        .route("/api/usage", get(billing::billing_list_usage))
        .route("/api/billing/portal", post(billing::billing_create_portal))
        .route("/api/billing/webhook", post(billing::billing_webhook))
        .merge(limited)
}

/// key: cors -> dashboard origins only
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%origin, ?err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("stripe-signature"),
        ])
        .expose_headers([
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            header::RETRY_AFTER,
        ])
        .allow_origin(AllowOrigin::list(allowed))
}

/// Assembles the API router with its extensions; `/metrics` is added by the binary.
pub fn build_app(services: AppServices, origins: &[String]) -> Router {
    api_routes(services.limiter.clone())
        .layer(Extension(services.pool))
        .layer(Extension(services.billing))
        .layer(Extension(services.ai))
        .layer(Extension(services.verifier))
        .layer(Extension(services.prices))
        .layer(Extension(services.sessions))
        .layer(Extension(services.launch))
        .layer(cors_layer(origins))
}
