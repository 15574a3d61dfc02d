mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use tower::ServiceExt;

use common::{app, unreachable_pool, Upstreams};

#[tokio::test]
async fn metrics_render_alongside_api() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(app(unreachable_pool(), &Upstreams::default()))
        .layer(layer);

    let plans = app
        .clone()
        .oneshot(Request::builder().uri("/api/plans").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(plans.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
