use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::plans::{PlanStatus, PlanTier, PriceCatalog};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the billing platform's webhook signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingHeader,
    #[error("signature header malformed")]
    Malformed,
    #[error("signature timestamp missing")]
    MissingTimestamp,
    #[error("no v1 signature present")]
    MissingSignature,
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("signature mismatch")]
    Mismatch,
}

/// key: billing-webhook-verifier -> hmac over `{t}.{body}`
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(
        &self,
        header: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let header = header
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingHeader)?;

        let mut timestamp: Option<i64> = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let (key, value) = part.trim().split_once('=').ok_or(SignatureError::Malformed)?;
            match key {
                "t" => {
                    timestamp = Some(value.parse().map_err(|_| SignatureError::Malformed)?);
                }
                "v1" => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if signatures.is_empty() {
            return Err(SignatureError::MissingSignature);
        }
        if (now.timestamp() - timestamp).abs() > self.tolerance_secs {
            return Err(SignatureError::TimestampOutOfTolerance);
        }

        let matched = signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            // constant-time comparison
            self.mac(timestamp, payload).verify_slice(&expected).is_ok()
        });
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Builds a header value in the billing platform's format. Used by tooling that replays
    /// events against the service.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        let digest = self.mac(timestamp, payload).finalize().into_bytes();
        format!("t={timestamp},v1={}", hex::encode(digest))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("event {event_type} missing `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
    #[error("event {event_type} names unknown plan `{plan}`")]
    UnknownPlan { event_type: String, plan: String },
}

/// Envelope delivered by the billing platform.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: ProviderEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEventData {
    pub object: Value,
}

impl ProviderEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, WebhookError> {
        serde_json::from_slice(payload).map_err(|err| WebhookError::Malformed(err.to_string()))
    }

    /// When the platform created the event; used to skip out-of-order deliveries.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub tier: PlanTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub status: PlanStatus,
    pub tier: Option<PlanTier>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
}

/// Billing events the service acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionChanged(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    PaymentFailed { subscription_id: String },
    PaymentSucceeded { subscription_id: String },
    Ignored,
}

impl BillingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingEvent::CheckoutCompleted(_) => "checkout_completed",
            BillingEvent::SubscriptionChanged(_) => "subscription_changed",
            BillingEvent::SubscriptionDeleted(_) => "subscription_deleted",
            BillingEvent::PaymentFailed { .. } => "payment_failed",
            BillingEvent::PaymentSucceeded { .. } => "payment_succeeded",
            BillingEvent::Ignored => "ignored",
        }
    }
}

pub fn classify_event(
    event: &ProviderEvent,
    prices: &PriceCatalog,
) -> Result<BillingEvent, WebhookError> {
    let object = &event.data.object;
    let event_type = event.event_type.as_str();
    match event_type {
        "checkout.session.completed" => {
            let session_id = required_str(object, event_type, "id")?;
            let user_ref = str_field(object, "client_reference_id")
                .or_else(|| metadata_str(object, "user_id"))
                .ok_or_else(|| missing(event_type, "client_reference_id"))?;
            let user_id = Uuid::parse_str(user_ref).map_err(|_| {
                WebhookError::Malformed(format!("invalid user reference `{user_ref}`"))
            })?;
            let plan = metadata_str(object, "plan")
                .ok_or_else(|| missing(event_type, "metadata.plan"))?;
            let tier = parse_tier(event_type, plan)?;
            Ok(BillingEvent::CheckoutCompleted(CheckoutCompleted {
                session_id: session_id.to_string(),
                user_id,
                customer_id: str_field(object, "customer").map(str::to_string),
                subscription_id: str_field(object, "subscription").map(str::to_string),
                tier,
            }))
        }
        "customer.subscription.created" | "customer.subscription.updated" => Ok(
            BillingEvent::SubscriptionChanged(subscription_snapshot(object, event_type, prices)?),
        ),
        "customer.subscription.deleted" => Ok(BillingEvent::SubscriptionDeleted(
            subscription_snapshot(object, event_type, prices)?,
        )),
        "invoice.payment_failed" => match str_field(object, "subscription") {
            Some(subscription_id) => Ok(BillingEvent::PaymentFailed {
                subscription_id: subscription_id.to_string(),
            }),
            // one-off invoices carry no subscription
            None => Ok(BillingEvent::Ignored),
        },
        "invoice.paid" | "invoice.payment_succeeded" => match str_field(object, "subscription") {
            Some(subscription_id) => Ok(BillingEvent::PaymentSucceeded {
                subscription_id: subscription_id.to_string(),
            }),
            None => Ok(BillingEvent::Ignored),
        },
        _ => Ok(BillingEvent::Ignored),
    }
}

fn subscription_snapshot(
    object: &Value,
    event_type: &str,
    prices: &PriceCatalog,
) -> Result<SubscriptionSnapshot, WebhookError> {
    let subscription_id = required_str(object, event_type, "id")?;
    let status = required_str(object, event_type, "status")?;

    let tier = match metadata_str(object, "plan") {
        Some(plan) => Some(parse_tier(event_type, plan)?),
        None => object
            .pointer("/items/data/0/price/id")
            .and_then(Value::as_str)
            .and_then(|price_id| prices.tier_for_price(price_id)),
    };

    let user_id = metadata_str(object, "user_id").and_then(|value| Uuid::parse_str(value).ok());

    Ok(SubscriptionSnapshot {
        subscription_id: subscription_id.to_string(),
        customer_id: str_field(object, "customer").map(str::to_string),
        status: PlanStatus::from_provider(status),
        tier,
        current_period_start: unix_field(object, "current_period_start"),
        current_period_end: unix_field(object, "current_period_end"),
        user_id,
    })
}

fn parse_tier(event_type: &str, plan: &str) -> Result<PlanTier, WebhookError> {
    plan.parse().map_err(|_| WebhookError::UnknownPlan {
        event_type: event_type.to_string(),
        plan: plan.to_string(),
    })
}

fn missing(event_type: &str, field: &'static str) -> WebhookError {
    WebhookError::MissingField {
        event_type: event_type.to_string(),
        field,
    }
}

fn required_str<'a>(
    object: &'a Value,
    event_type: &str,
    field: &'static str,
) -> Result<&'a str, WebhookError> {
    str_field(object, field).ok_or_else(|| missing(event_type, field))
}

fn str_field<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn metadata_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object
        .get("metadata")
        .and_then(|metadata| metadata.get(key))
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn unix_field(object: &Value, field: &str) -> Option<DateTime<Utc>> {
    object
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}
