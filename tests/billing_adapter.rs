use aurion_backend::billing::{BillingProviderAdapter, CheckoutRequest, HttpBillingAdapter};
use aurion_backend::plans::PlanTier;
use httpmock::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn checkout_request() -> CheckoutRequest {
    CheckoutRequest {
        user_id: Uuid::new_v4(),
        email: Some("ada@example.com".into()),
        customer_id: None,
        tier: PlanTier::Starter,
        price_id: "price_starter".into(),
        success_url: "http://localhost:5173/dashboard?checkout=success".into(),
        cancel_url: "http://localhost:5173/dashboard?checkout=cancel".into(),
    }
}

#[tokio::test]
async fn http_billing_adapter_opens_checkout_and_portal() {
    let server = MockServer::start_async().await;

    let checkout_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/checkout/sessions")
            .header("authorization", "Bearer sk_test")
            .body_contains("mode=subscription")
            .body_contains("price_starter")
            .body_contains("customer_email=ada%40example.com");
        then.status(200).json_body(json!({
            "id": "cs_test_123",
            "url": "https://checkout.example/cs_test_123",
            "object": "checkout.session"
        }));
    });

    let portal_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/billing_portal/sessions")
            .body_contains("customer=cus_42");
        then.status(200).json_body(json!({
            "id": "bps_1",
            "url": "https://billing.example/session/bps_1"
        }));
    });

    let adapter = HttpBillingAdapter::new(server.base_url(), "sk_test").unwrap();
    let session = adapter
        .create_checkout_session(&checkout_request())
        .await
        .expect("checkout session should be created");
    assert_eq!(session.id, "cs_test_123");
    assert_eq!(session.url, "https://checkout.example/cs_test_123");

    let portal = adapter
        .create_portal_session("cus_42", "http://localhost:5173/dashboard")
        .await
        .unwrap();
    assert_eq!(portal.url, "https://billing.example/session/bps_1");

    checkout_mock.assert();
    portal_mock.assert();
}

#[tokio::test]
async fn http_billing_adapter_surfaces_rejections() {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/checkout/sessions");
        then.status(402)
            .json_body(json!({ "error": { "message": "card declined" } }));
    });

    let adapter = HttpBillingAdapter::new(server.base_url(), "sk_test").unwrap();
    let err = adapter
        .create_checkout_session(&checkout_request())
        .await
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("402"), "unexpected error: {message}");
    assert!(message.contains("card declined"));
    mock.assert();
}
