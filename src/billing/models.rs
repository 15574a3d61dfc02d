use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::plans::{PlanStatus, PlanTier};

/// key: billing-plan-model -> per-user plan record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserPlan {
    pub user_id: Uuid,
    pub tier: String,
    pub status: String,
    pub billing_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserPlan {
    /// Unknown tiers in storage are treated as free.
    pub fn tier(&self) -> PlanTier {
        self.tier.parse().unwrap_or(PlanTier::Free)
    }

    pub fn status(&self) -> PlanStatus {
        PlanStatus::from_provider(&self.status)
    }
}

/// key: billing-balance-model -> credit counters
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: Uuid,
    pub total_credits: i64,
    pub used_credits: i64,
    pub reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    pub fn available(&self) -> i64 {
        self.total_credits.saturating_sub(self.used_credits).max(0)
    }
}

/// key: billing-usage-model -> usage log rows
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action: String,
    pub tool_id: String,
    pub credits: i64,
    pub refunded: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingSession {
    pub id: String,
    pub user_id: Uuid,
    pub plan: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of a successful debit.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCharge {
    pub usage_id: Uuid,
    pub tool_id: String,
    pub credits_charged: i64,
    pub remaining_credits: i64,
}

/// Row produced by the `credit_integrity_violations()` stored procedure.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IntegrityViolation {
    pub user_id: Uuid,
    pub total_credits: i64,
    pub used_credits: i64,
    pub reason: String,
}
