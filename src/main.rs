use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aurion_backend::ai::AiGateway;
use aurion_backend::billing::{
    spawn_billing_maintenance, BillingProviderAdapter, HttpBillingAdapter, SignatureVerifier,
};
use aurion_backend::rate_limit::{spawn_janitor, RateLimiter};
use aurion_backend::tool_sessions::ToolSessionIssuer;
use aurion_backend::tools::ToolLaunchConfig;
use aurion_backend::{build_app, config, integration_config_from_env, AppServices};
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::AUTH_JWT_SECRET.as_str();
    let integrations = integration_config_from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let billing: Arc<dyn BillingProviderAdapter> = Arc::new(HttpBillingAdapter::new(
        integrations.billing_api_base_url.clone(),
        integrations.billing_api_key.clone(),
    )?);
    let ai = Arc::new(AiGateway::new(
        integrations.llm_router_base_url.clone(),
        integrations.llm_router_api_key.clone(),
        integrations.llm_default_model.clone(),
        integrations.image_api_base_url.clone(),
        integrations.image_api_key.clone(),
    )?);
    if integrations.llm_router_api_key.is_none() {
        tracing::warn!("LLM_ROUTER_API_KEY is not set; chat requests will be refused");
    }
    if integrations.image_api_key.is_none() {
        tracing::warn!("IMAGE_API_KEY is not set; image requests will be refused");
    }

    let limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(*config::RATE_LIMIT_WINDOW_SECS),
        *config::RATE_LIMIT_MAX_REQUESTS,
    ));
    spawn_janitor(limiter.clone());
    spawn_billing_maintenance(pool.clone());

    let services = AppServices {
        pool: pool.clone(),
        billing,
        ai,
        verifier: Arc::new(SignatureVerifier::new(
            integrations.billing_webhook_secret.clone(),
            integrations.billing_webhook_tolerance_secs,
        )),
        prices: Arc::new(integrations.prices.clone()),
        sessions: Arc::new(ToolSessionIssuer::new(
            integrations.tool_session_secret.clone(),
            chrono::Duration::seconds(integrations.tool_session_ttl_secs),
        )),
        launch: Arc::new(ToolLaunchConfig {
            base_url: integrations.tool_launch_base_url.clone(),
        }),
        limiter,
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(build_app(services, &config::CORS_ALLOWED_ORIGINS))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
