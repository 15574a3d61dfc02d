mod common;

use std::time::Duration;

use aurion_backend::billing::BillingService;
use axum::http::StatusCode;
use httpmock::prelude::*;
use serde_json::json;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use common::{app, body_json, post_json, Upstreams};

fn upstreams(server: &MockServer) -> Upstreams {
    Upstreams {
        router: server.base_url(),
        images: server.base_url(),
        ..Upstreams::default()
    }
}

// key: ai-proxy-tests -> debit on success, refund on failure
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn chat_is_forwarded_and_debited(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .header("authorization", "Bearer router-key")
            .json_body_partial(r#"{ "model": "test-model" }"#);
        then.status(200).json_body(json!({
            "choices": [ { "message": { "role": "assistant", "content": "hello" } } ]
        }));
    });

    let user_id = Uuid::new_v4();
    let response = app(pool.clone(), &upstreams(&server))
        .oneshot(post_json(
            "/api/ai/chat",
            Some(user_id),
            &json!({ "messages": [ { "role": "user", "content": "hi" } ] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    mock.assert();

    let service = BillingService::new(pool);
    let (_, balance) = service.account_snapshot(user_id).await.unwrap().unwrap();
    assert_eq!(balance.used_credits, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_chat_upstream_refunds(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(503).body("overloaded");
    });

    let user_id = Uuid::new_v4();
    let response = app(pool.clone(), &upstreams(&server))
        .oneshot(post_json(
            "/api/ai/chat",
            Some(user_id),
            &json!({ "messages": [ { "role": "user", "content": "hi" } ] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["error"], "upstream service failed");

    let service = BillingService::new(pool);
    let (_, balance) = service.account_snapshot(user_id).await.unwrap().unwrap();
    assert_eq!(balance.used_credits, 0);
    let usage = service.recent_usage(user_id, 5).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].refunded);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn free_tier_cannot_generate_images(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST).path("/images/generations");
        then.status(200).json_body(json!({ "data": [] }));
    });

    let response = app(pool, &upstreams(&server))
        .oneshot(post_json(
            "/api/ai/image",
            Some(Uuid::new_v4()),
            &json!({ "prompt": "a lighthouse at dusk", "n": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    mock.assert_hits(0);
}

async fn starter_user(pool: &PgPool) -> Uuid {
    let user_id = Uuid::new_v4();
    BillingService::new(pool.clone())
        .ensure_profile(user_id, None)
        .await
        .unwrap();
    sqlx::query(
        r#"
        UPDATE user_plans
        SET tier = 'starter', status = 'active', billing_subscription_id = $2
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(format!("sub_{user_id}"))
    .execute(pool)
    .await
    .unwrap();
    sqlx::query("UPDATE credit_balances SET total_credits = 500 WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap();
    user_id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn images_are_debited_per_image(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/images/generations")
            .header("authorization", "Bearer image-key")
            .json_body_partial(r#"{ "n": 2 }"#);
        then.status(200)
            .json_body(json!({ "data": [ { "url": "a" }, { "url": "b" } ] }));
    });

    let user_id = starter_user(&pool).await;
    let response = app(pool.clone(), &upstreams(&server))
        .oneshot(post_json(
            "/api/ai/image",
            Some(user_id),
            &json!({ "prompt": "a lighthouse at dusk", "n": 2 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"].as_array().unwrap().len(), 2);
    mock.assert();

    let (_, balance) = BillingService::new(pool)
        .account_snapshot(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(balance.used_credits, 10);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_image_upstream_refunds(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/images/generations");
        then.status(500).body("model crashed");
    });

    let user_id = starter_user(&pool).await;
    let response = app(pool.clone(), &upstreams(&server))
        .oneshot(post_json(
            "/api/ai/image",
            Some(user_id),
            &json!({ "prompt": "a lighthouse at dusk", "n": 3 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let service = BillingService::new(pool);
    let (_, balance) = service.account_snapshot(user_id).await.unwrap().unwrap();
    assert_eq!(balance.used_credits, 0);
    let usage = service.recent_usage(user_id, 5).await.unwrap();
    assert_eq!(usage[0].credits, 15);
    assert!(usage[0].refunded);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn client_disconnect_still_refunds_failed_upstream(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(503)
            .body("overloaded")
            .delay(Duration::from_millis(1_000));
    });

    let user_id = Uuid::new_v4();
    let request = app(pool.clone(), &upstreams(&server)).oneshot(post_json(
        "/api/ai/chat",
        Some(user_id),
        &json!({ "messages": [ { "role": "user", "content": "hi" } ] }),
    ));
    // the caller gives up while the upstream is still working
    let abandoned = tokio::time::timeout(Duration::from_millis(400), request).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    mock.assert();
    let service = BillingService::new(pool);
    let (_, balance) = service.account_snapshot(user_id).await.unwrap().unwrap();
    assert_eq!(balance.used_credits, 0);
    assert!(service.recent_usage(user_id, 5).await.unwrap()[0].refunded);
}
