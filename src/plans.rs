use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use axum::Json;
use serde::{Deserialize, Serialize};

/// Subscription tiers, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Free,
        PlanTier::Starter,
        PlanTier::Pro,
        PlanTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }

    pub fn limits(&self) -> PlanLimits {
        match self {
            PlanTier::Free => PlanLimits {
                monthly_credits: 50,
                daily_actions: Some(5),
                price_cents: 0,
            },
            PlanTier::Starter => PlanLimits {
                monthly_credits: 500,
                daily_actions: Some(50),
                price_cents: 900,
            },
            PlanTier::Pro => PlanLimits {
                monthly_credits: 2_000,
                daily_actions: Some(200),
                price_cents: 2_900,
            },
            PlanTier::Enterprise => PlanLimits {
                monthly_credits: 10_000,
                daily_actions: None,
                price_cents: 9_900,
            },
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan `{0}`")]
pub struct UnknownPlan(pub String);

impl FromStr for PlanTier {
    type Err = UnknownPlan;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "starter" => Ok(PlanTier::Starter),
            "pro" => Ok(PlanTier::Pro),
            "enterprise" => Ok(PlanTier::Enterprise),
            _ => Err(UnknownPlan(value.to_string())),
        }
    }
}

/// Allowances attached to a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub monthly_credits: i64,
    /// `None` means unlimited.
    pub daily_actions: Option<i64>,
    pub price_cents: i32,
}

/// Mirror of the billing platform's subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl PlanStatus {
    pub fn from_provider(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => PlanStatus::Active,
            "trialing" => PlanStatus::Trialing,
            "past_due" => PlanStatus::PastDue,
            "canceled" | "cancelled" => PlanStatus::Canceled,
            "unpaid" => PlanStatus::Unpaid,
            "incomplete_expired" => PlanStatus::IncompleteExpired,
            "paused" => PlanStatus::Paused,
            _ => PlanStatus::Incomplete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Trialing => "trialing",
            PlanStatus::PastDue => "past_due",
            PlanStatus::Canceled => "canceled",
            PlanStatus::Unpaid => "unpaid",
            PlanStatus::Incomplete => "incomplete",
            PlanStatus::IncompleteExpired => "incomplete_expired",
            PlanStatus::Paused => "paused",
        }
    }

    pub fn grants_access(&self) -> bool {
        matches!(self, PlanStatus::Active | PlanStatus::Trialing)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing-platform price identifiers for each purchasable tier.
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    prices: HashMap<PlanTier, String>,
}

impl PriceCatalog {
    pub fn insert(&mut self, tier: PlanTier, price_id: impl Into<String>) {
        self.prices.insert(tier, price_id.into());
    }

    pub fn price_for(&self, tier: PlanTier) -> Option<&str> {
        self.prices.get(&tier).map(String::as_str)
    }

    pub fn tier_for_price(&self, price_id: &str) -> Option<PlanTier> {
        self.prices
            .iter()
            .find(|(_, candidate)| candidate.as_str() == price_id)
            .map(|(tier, _)| *tier)
    }
}

#[derive(Debug, Serialize)]
pub struct PlanCatalogEntry {
    pub tier: PlanTier,
    pub limits: PlanLimits,
    pub purchasable: bool,
}

pub fn plan_catalog() -> Vec<PlanCatalogEntry> {
    PlanTier::ALL
        .iter()
        .map(|tier| PlanCatalogEntry {
            tier: *tier,
            limits: tier.limits(),
            purchasable: tier.is_paid(),
        })
        .collect()
}

pub async fn list_plans() -> Json<Vec<PlanCatalogEntry>> {
    Json(plan_catalog())
}
