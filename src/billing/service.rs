use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::access::{evaluate_access, start_of_utc_day, AccessContext, AccessDecision, AccessDenial};
use super::models::{CreditBalance, IntegrityViolation, ToolCharge, UsageLogEntry, UserPlan};
use crate::plans::PlanTier;
use crate::tools::find_tool;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Denied(#[from] AccessDenial),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("requested quantity must be at least 1")]
    InvalidQuantity,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// key: billing-service -> plans, balances, usage
#[derive(Clone)]
pub struct BillingService {
    pool: PgPool,
    grace: Duration,
}

impl BillingService {
    pub fn new(pool: PgPool) -> Self {
        Self::with_grace(pool, Duration::days(*crate::config::BILLING_PAST_DUE_GRACE_DAYS))
    }

    pub fn with_grace(pool: PgPool, grace: Duration) -> Self {
        Self { pool, grace }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the profile, a free plan and the free allowance on first sight of a user.
    pub async fn ensure_profile(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let created = sqlx::query(
            "INSERT INTO profiles (id, email) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(user_id)
        .bind(email)
        .execute(&mut tx)
        .await?
        .rows_affected();
        sqlx::query(
            r#"
            INSERT INTO user_plans (user_id, tier, status)
            VALUES ($1, 'free', 'active')
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO credit_balances (user_id, total_credits, used_credits)
            VALUES ($1, $2, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(PlanTier::Free.limits().monthly_credits)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;
        if created > 0 {
            info!(%user_id, "provisioned profile on free plan");
        }
        Ok(())
    }

    pub async fn account_snapshot(
        &self,
        user_id: Uuid,
    ) -> Result<Option<(UserPlan, CreditBalance)>, sqlx::Error> {
        let plan = sqlx::query_as::<_, UserPlan>("SELECT * FROM user_plans WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let balance =
            sqlx::query_as::<_, CreditBalance>("SELECT * FROM credit_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(plan.zip(balance))
    }

    /// Paid actions since UTC midnight, refunds excluded.
    pub async fn actions_today(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM usage_logs
            WHERE user_id = $1 AND refunded = FALSE AND created_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(start_of_utc_day(now))
        .fetch_one(&self.pool)
        .await
    }

    /// Runs the access check for `tool_id` and debits its cost.
    ///
    /// The debit is a single conditional update, so concurrent callers can never push the
    /// balance below zero; the loser of a race is denied with insufficient credits.
    pub async fn authorize_and_debit(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        tool_id: &str,
        units: i64,
        metadata: Value,
    ) -> Result<ToolCharge, BillingError> {
        if units < 1 {
            return Err(BillingError::InvalidQuantity);
        }
        let tool =
            find_tool(tool_id).ok_or_else(|| BillingError::UnknownTool(tool_id.to_string()))?;

        self.ensure_profile(user_id, email).await?;
        let now = Utc::now();
        let (plan, balance) = self
            .account_snapshot(user_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        let actions_today = self.actions_today(user_id, now).await?;

        let ctx = AccessContext {
            plan: &plan,
            balance: &balance,
            actions_today,
            now,
            grace: self.grace,
        };
        let cost = match evaluate_access(tool, units, &ctx) {
            AccessDecision::Allowed { cost, .. } => cost,
            AccessDecision::Denied(denial) => {
                debug!(%user_id, tool = tool.id, ?denial, "tool access denied");
                return Err(denial.into());
            }
        };

        let mut tx = self.pool.begin().await?;
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE credit_balances
            SET used_credits = used_credits + $2, updated_at = NOW()
            WHERE user_id = $1 AND total_credits - used_credits >= $2
            RETURNING total_credits - used_credits
            "#,
        )
        .bind(user_id)
        .bind(cost)
        .fetch_optional(&mut tx)
        .await?;

        let Some(remaining) = remaining else {
            let available: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT GREATEST(total_credits - used_credits, 0)
                FROM credit_balances
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(&mut tx)
            .await?;
            tx.rollback().await?;
            return Err(AccessDenial::InsufficientCredits {
                required: cost,
                available: available.unwrap_or(0),
            }
            .into());
        };

        let usage_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO usage_logs (id, user_id, action, tool_id, credits, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(usage_id)
        .bind(user_id)
        .bind(tool.action)
        .bind(tool.id)
        .bind(cost)
        .bind(metadata)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;

        info!(%user_id, tool = tool.id, credits = cost, remaining, "credits debited");
        Ok(ToolCharge {
            usage_id,
            tool_id: tool.id.to_string(),
            credits_charged: cost,
            remaining_credits: remaining,
        })
    }

    /// Returns the credits of a usage row. Returns `false` when the row is unknown or was
    /// already refunded.
    pub async fn refund(&self, user_id: Uuid, usage_id: Uuid) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let credits: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE usage_logs
            SET refunded = TRUE
            WHERE id = $1 AND user_id = $2 AND refunded = FALSE
            RETURNING credits
            "#,
        )
        .bind(usage_id)
        .bind(user_id)
        .fetch_optional(&mut tx)
        .await?;
        let Some(credits) = credits else {
            tx.rollback().await?;
            return Ok(false);
        };
        sqlx::query(
            r#"
            UPDATE credit_balances
            SET used_credits = GREATEST(used_credits - $2, 0), updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(credits)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;
        info!(%user_id, %usage_id, credits, "usage refunded");
        Ok(true)
    }

    pub async fn recent_usage(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageLogEntry>, sqlx::Error> {
        sqlx::query_as::<_, UsageLogEntry>(
            "SELECT * FROM usage_logs WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn customer_id(&self, user_id: Uuid) -> Result<Option<String>, sqlx::Error> {
        let customer: Option<Option<String>> =
            sqlx::query_scalar("SELECT billing_customer_id FROM profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(customer.flatten())
    }

    pub async fn record_checkout_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        tier: PlanTier,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO billing_sessions (id, user_id, plan, status)
            VALUES ($1, $2, $3, 'open')
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(tier.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Calls the `credit_integrity_violations()` stored procedure.
    pub async fn integrity_report(&self) -> Result<Vec<IntegrityViolation>, sqlx::Error> {
        sqlx::query_as::<_, IntegrityViolation>(
            r#"
            SELECT user_id, total_credits, used_credits, reason
            FROM credit_integrity_violations()
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn plan_counts(&self) -> Result<Vec<(String, String, i64)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT tier, status, COUNT(*)
            FROM user_plans
            GROUP BY tier, status
            ORDER BY tier, status
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn processed_event_count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM billing_events")
            .fetch_one(&self.pool)
            .await
    }
}

/// Refills the balance to the tier allowance and zeroes usage.
pub(crate) async fn reset_credits<'e, E>(
    executor: E,
    user_id: Uuid,
    tier: PlanTier,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE credit_balances
        SET total_credits = $2, used_credits = 0, reset_at = NOW(), updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(tier.limits().monthly_credits)
    .execute(executor)
    .await?;
    Ok(())
}

/// Moves the balance to a new tier allowance without refilling it; usage is clamped so the
/// balance never goes negative.
pub(crate) async fn rescale_credits<'e, E>(
    executor: E,
    user_id: Uuid,
    tier: PlanTier,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE credit_balances
        SET total_credits = $2, used_credits = LEAST(used_credits, $2), updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(tier.limits().monthly_credits)
    .execute(executor)
    .await?;
    Ok(())
}
