use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;

use super::models::{CreditBalance, UserPlan};
use crate::plans::{PlanStatus, PlanTier};
use crate::tools::ToolDefinition;

/// Why a paid action was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AccessDenial {
    #[error("subscription is {status}; renew your plan to continue")]
    PlanInactive { status: PlanStatus },
    #[error("`{tool}` requires the {required} plan (current plan: {current})")]
    UpgradeRequired {
        tool: String,
        required: PlanTier,
        current: PlanTier,
    },
    #[error("daily limit of {limit} actions reached")]
    DailyLimitReached { limit: i64, retry_after: u64 },
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed { cost: i64, remaining_after: i64 },
    Denied(AccessDenial),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed { .. })
    }
}

/// Current counters for the caller, as read from the managed backend.
pub struct AccessContext<'a> {
    pub plan: &'a UserPlan,
    pub balance: &'a CreditBalance,
    pub actions_today: i64,
    pub now: DateTime<Utc>,
    pub grace: Duration,
}

/// A paid tier keeps access while its status grants it and its period (plus grace) has not
/// ended. The free tier always has access.
pub fn plan_grants_access(plan: &UserPlan, now: DateTime<Utc>, grace: Duration) -> bool {
    if !plan.tier().is_paid() {
        return true;
    }
    if !plan.status().grants_access() {
        return false;
    }
    match plan.current_period_end {
        Some(end) => end + grace >= now,
        None => true,
    }
}

pub fn credit_cost(tool: &ToolDefinition, units: i64) -> i64 {
    tool.credit_cost.saturating_mul(units.max(1))
}

/// Checks run in order: plan state, tier, daily counter, balance.
pub fn evaluate_access(
    tool: &ToolDefinition,
    units: i64,
    ctx: &AccessContext<'_>,
) -> AccessDecision {
    let tier = ctx.plan.tier();

    if !plan_grants_access(ctx.plan, ctx.now, ctx.grace) {
        let status = match ctx.plan.status() {
            // Period lapsed while the mirror still says active.
            PlanStatus::Active | PlanStatus::Trialing => PlanStatus::PastDue,
            other => other,
        };
        return AccessDecision::Denied(AccessDenial::PlanInactive { status });
    }

    if tier < tool.min_tier {
        return AccessDecision::Denied(AccessDenial::UpgradeRequired {
            tool: tool.id.to_string(),
            required: tool.min_tier,
            current: tier,
        });
    }

    if let Some(limit) = tier.limits().daily_actions {
        if ctx.actions_today >= limit {
            return AccessDecision::Denied(AccessDenial::DailyLimitReached {
                limit,
                retry_after: seconds_until_next_utc_day(ctx.now),
            });
        }
    }

    let cost = credit_cost(tool, units);
    let available = ctx.balance.available();
    if available < cost {
        return AccessDecision::Denied(AccessDenial::InsufficientCredits {
            required: cost,
            available,
        });
    }

    AccessDecision::Allowed {
        cost,
        remaining_after: available - cost,
    }
}

pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now)
}

fn seconds_until_next_utc_day(now: DateTime<Utc>) -> u64 {
    let next = start_of_utc_day(now) + Duration::days(1);
    (next - now).num_seconds().max(1) as u64
}
