use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plans::PlanTier;

/// Everything the billing platform needs to open a hosted checkout page.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub tier: PlanTier,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortalSession {
    pub url: String,
}

/// key: billing-adapter -> provider integration
#[async_trait]
pub trait BillingProviderAdapter: Send + Sync {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession>;
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession>;
}

/// key: billing-adapter-http -> hosted billing REST API
pub struct HttpBillingAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpBillingAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build billing client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
        what: &str,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .form(form)
            .send()
            .await
            .with_context(|| format!("failed to contact billing platform for {what}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("billing platform rejected {what} ({status}): {body}"));
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to decode billing platform {what} response"))
    }
}

pub(crate) fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    let user_id = request.user_id.to_string();
    let plan = request.tier.as_str().to_string();
    let mut form = vec![
        ("mode".to_string(), "subscription".to_string()),
        ("line_items[0][price]".to_string(), request.price_id.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        ("client_reference_id".to_string(), user_id.clone()),
        ("metadata[user_id]".to_string(), user_id.clone()),
        ("metadata[plan]".to_string(), plan.clone()),
        ("subscription_data[metadata][user_id]".to_string(), user_id),
        ("subscription_data[metadata][plan]".to_string(), plan),
    ];
    match (&request.customer_id, &request.email) {
        (Some(customer_id), _) => form.push(("customer".to_string(), customer_id.clone())),
        (None, Some(email)) => form.push(("customer_email".to_string(), email.clone())),
        (None, None) => {}
    }
    form
}

#[async_trait]
impl BillingProviderAdapter for HttpBillingAdapter {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        self.post_form("v1/checkout/sessions", &checkout_form(request), "checkout session")
            .await
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        self.post_form("v1/billing_portal/sessions", &form, "portal session")
            .await
    }
}
