pub mod access;
pub mod adapters;
pub mod api;
pub mod models;
pub mod reconciliation;
pub mod scheduler;
pub mod service;
pub mod webhook;

pub use access::{evaluate_access, AccessContext, AccessDecision, AccessDenial};
pub use adapters::{
    BillingProviderAdapter, CheckoutRequest, CheckoutSession, HttpBillingAdapter, PortalSession,
};
pub use api::{
    billing_webhook, create_checkout as billing_create_checkout,
    create_portal as billing_create_portal, get_credits as billing_get_credits,
    list_usage as billing_list_usage, CheckoutBody, CheckoutResponse, CreditsResponse,
    WebhookAck,
};
pub use models::{
    BillingSession, CreditBalance, IntegrityViolation, ToolCharge, UsageLogEntry, UserPlan,
};
pub use reconciliation::{apply_event, ReconcileOutcome};
pub use scheduler::{
    process_tick as run_billing_maintenance_tick, spawn as spawn_billing_maintenance,
    MaintenanceReport,
};
pub use service::{BillingError, BillingService};
pub use webhook::{classify_event, BillingEvent, ProviderEvent, SignatureVerifier};
