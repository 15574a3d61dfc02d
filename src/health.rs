use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub database: &'static str,
    pub version: &'static str,
}

/// key: health -> database ping
pub async fn health(Extension(pool): Extension<PgPool>) -> (StatusCode, Json<HealthReport>) {
    let version = env!("CARGO_PKG_VERSION");
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthReport {
                status: "ok",
                database: "ok",
                version,
            }),
        ),
        Err(err) => {
            warn!(?err, "health check could not reach the database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthReport {
                    status: "degraded",
                    database: "unavailable",
                    version,
                }),
            )
        }
    }
}
