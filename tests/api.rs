mod common;

use aurion_backend::billing::BillingService;
use aurion_backend::build_app;
use aurion_backend::tool_sessions::ToolSessionIssuer;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use httpmock::prelude::*;
use serde_json::json;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use common::{
    app, body_json, post_json, services, unreachable_pool, Upstreams, APP_ORIGIN, TOOL_SECRET,
};

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_degraded_without_database() {
    let response = app(unreachable_pool(), &Upstreams::default())
        .oneshot(get("/api/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["database"], "unavailable");
}

#[tokio::test]
async fn catalogs_are_public() {
    let app = app(unreachable_pool(), &Upstreams::default());

    let plans = body_json(app.clone().oneshot(get("/api/plans")).await.unwrap()).await;
    let tiers: Vec<_> = plans
        .as_array()
        .unwrap()
        .iter()
        .map(|plan| plan["tier"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tiers, ["free", "starter", "pro", "enterprise"]);
    assert_eq!(plans[0]["limits"]["monthly_credits"], 50);
    assert_eq!(plans[3]["limits"]["daily_actions"], serde_json::Value::Null);

    let tools = body_json(app.oneshot(get("/api/tools")).await.unwrap()).await;
    assert!(tools
        .as_array()
        .unwrap()
        .iter()
        .any(|tool| tool["id"] == "video-studio" && tool["min_tier"] == "pro"));
}

#[tokio::test]
async fn dashboard_requires_bearer() {
    let response = app(unreachable_pool(), &Upstreams::default())
        .oneshot(get("/api/credits"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn checkout_rejects_bad_plans_and_foreign_redirects() {
    let app = app(unreachable_pool(), &Upstreams::default());
    let user = Some(Uuid::new_v4());

    for body in [
        json!({ "plan": "platinum" }),
        json!({ "plan": "free" }),
        json!({ "plan": "pro", "success_url": "https://evil.example/phish" }),
    ] {
        let response = app
            .clone()
            .oneshot(post_json("/api/billing/checkout", user, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
    }
}

#[tokio::test]
async fn chat_requires_messages() {
    let response = app(unreachable_pool(), &Upstreams::default())
        .oneshot(post_json(
            "/api/ai/chat",
            Some(Uuid::new_v4()),
            &json!({ "messages": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tool_sessions_validate_for_their_tool_only() {
    let issuer = ToolSessionIssuer::new(TOOL_SECRET, chrono::Duration::minutes(5));
    let user_id = Uuid::new_v4();
    let issued = issuer
        .issue(user_id, "code-studio", Uuid::new_v4(), chrono::Utc::now())
        .unwrap();
    let app = app(unreachable_pool(), &Upstreams::default());

    let ok = app
        .clone()
        .oneshot(post_json(
            "/api/tools/session/validate",
            None,
            &json!({ "token": issued.token, "tool_id": "code-studio" }),
        ))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let body = body_json(ok).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["user_id"], user_id.to_string());

    let wrong_tool = app
        .clone()
        .oneshot(post_json(
            "/api/tools/session/validate",
            None,
            &json!({ "token": issued.token, "tool_id": "video-studio" }),
        ))
        .await
        .unwrap();
    assert_eq!(wrong_tool.status(), StatusCode::FORBIDDEN);

    let forged = app
        .oneshot(post_json(
            "/api/tools/session/validate",
            None,
            &json!({ "token": "not-a-token" }),
        ))
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn limited_routes_report_quota_and_throttle() {
    let app = build_app(
        services(unreachable_pool(), &Upstreams::default(), 2),
        &[APP_ORIGIN.to_string()],
    );
    let request = || {
        Request::builder()
            .method("POST")
            .uri("/api/tools/session/validate")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::from(json!({ "token": "x" }).to_string()))
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.headers()["x-ratelimit-limit"], "2");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");
    assert!(first.headers().contains_key("x-ratelimit-reset"));

    let second = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    let third = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(third.headers().contains_key(header::RETRY_AFTER));

    // health is never throttled
    for _ in 0..3 {
        let health = app.clone().oneshot(get("/api/health")).await.unwrap();
        assert_ne!(health.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(!health.headers().contains_key("x-ratelimit-limit"));
    }
}

#[tokio::test]
async fn cors_allows_dashboard_origin() {
    let response = app(unreachable_pool(), &Upstreams::default())
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/credits")
                .header("origin", APP_ORIGIN)
                .header("access-control-request-method", "GET")
                .header("access-control-request-headers", "authorization")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        APP_ORIGIN
    );
}

// key: api-tests -> handlers backed by Postgres
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn tool_access_debits_and_issues_session(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = Uuid::new_v4();
    BillingService::new(pool.clone())
        .ensure_profile(user_id, None)
        .await
        .unwrap();
    sqlx::query(
        r#"
        UPDATE user_plans
        SET tier = 'starter', billing_subscription_id = 'sub_tools'
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("UPDATE credit_balances SET total_credits = 500 WHERE user_id = $1")
        .bind(user_id)
        .execute(&pool)
        .await
        .unwrap();
    let app = app(pool.clone(), &Upstreams::default());

    let embedded = app
        .clone()
        .oneshot(post_json(
            "/api/tools/access",
            Some(user_id),
            &json!({ "tool_id": "code-studio" }),
        ))
        .await
        .unwrap();
    assert_eq!(embedded.status(), StatusCode::OK);
    let body = body_json(embedded).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["credits_charged"], 3);
    assert_eq!(body["remaining_credits"], 497);
    let token = body["session_token"].as_str().unwrap();
    let claims = ToolSessionIssuer::new(TOOL_SECRET, chrono::Duration::minutes(5))
        .validate(token)
        .unwrap();
    assert_eq!(claims.sub, user_id);
    assert_eq!(claims.tool, "code-studio");
    assert!(body["launch_url"]
        .as_str()
        .unwrap()
        .starts_with("https://tools.aurion.test/code-studio?session="));

    let direct = app
        .clone()
        .oneshot(post_json("/api/tools/access", Some(user_id), &json!({ "tool_id": "chat" })))
        .await
        .unwrap();
    assert_eq!(direct.status(), StatusCode::OK);
    assert!(body_json(direct).await["launch_url"].is_null());

    let unknown = app
        .oneshot(post_json(
            "/api/tools/access",
            Some(user_id),
            &json!({ "tool_id": "time-machine" }),
        ))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn checkout_records_open_session(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/checkout/sessions")
            .body_contains("price_pro");
        then.status(200).json_body(json!({
            "id": "cs_test_open",
            "url": "https://checkout.example/cs_test_open"
        }));
    });
    let upstreams = Upstreams {
        billing: server.base_url(),
        ..Upstreams::default()
    };

    let user_id = Uuid::new_v4();
    let response = app(pool.clone(), &upstreams)
        .oneshot(post_json(
            "/api/billing/checkout",
            Some(user_id),
            &json!({ "plan": "pro" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["session_id"], "cs_test_open");
    assert_eq!(body["url"], "https://checkout.example/cs_test_open");
    mock.assert();

    let (plan, status): (String, String) =
        sqlx::query_as("SELECT plan, status FROM billing_sessions WHERE id = 'cs_test_open'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(plan, "pro");
    assert_eq!(status, "open");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn portal_requires_billing_customer(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = Uuid::new_v4();
    BillingService::new(pool.clone())
        .ensure_profile(user_id, None)
        .await
        .unwrap();

    let response = app(pool, &Upstreams::default())
        .oneshot(post_json("/api/billing/portal", Some(user_id), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
