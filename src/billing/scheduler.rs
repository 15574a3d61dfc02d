use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::plans::PlanTier;

use super::service::{rescale_credits, BillingService};

/// Counts of what a maintenance tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub marked_past_due: u64,
    pub downgraded: u64,
    pub free_balances_reset: u64,
    pub events_pruned: u64,
    pub integrity_violations: usize,
}

/// key: billing-maintenance-scheduler -> periodic upkeep
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::MAINTENANCE_INTERVAL_SECS);
    let grace_days = *config::BILLING_PAST_DUE_GRACE_DAYS;
    let retention_days = *config::BILLING_EVENT_RETENTION_DAYS;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match process_tick(&pool, Utc::now(), grace_days, retention_days).await {
                Ok(report) if report != MaintenanceReport::default() => {
                    info!(?report, "billing maintenance tick applied changes")
                }
                Ok(_) => debug!("billing maintenance tick found nothing to do"),
                Err(err) => warn!(?err, "billing maintenance tick failed"),
            }
        }
    });
}

/// key: billing-maintenance-scheduler -> tick handler
pub async fn process_tick(
    pool: &PgPool,
    now: DateTime<Utc>,
    grace_days: i64,
    retention_days: i64,
) -> Result<MaintenanceReport> {
    let grace = Duration::days(grace_days);
    let cutoff = now - grace;
    let mut report = MaintenanceReport::default();

    report.marked_past_due = sqlx::query(
        r#"
        UPDATE user_plans
        SET status = 'past_due', updated_at = $2
        WHERE tier <> 'free'
          AND status IN ('active', 'trialing')
          AND current_period_end IS NOT NULL
          AND current_period_end < $1
        "#,
    )
    .bind(cutoff)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    if report.marked_past_due > 0 {
        info!(count = report.marked_past_due, "marked lapsed plans past_due");
    }

    let lapsed = sqlx::query_as::<_, LapsedPlan>(
        r#"
        SELECT user_id, tier, status
        FROM user_plans
        WHERE tier <> 'free'
          AND status NOT IN ('active', 'trialing')
          AND updated_at < $1
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    for plan in lapsed {
        match downgrade_to_free(pool, plan.user_id, now).await {
            Ok(true) => {
                report.downgraded += 1;
                info!(
                    user_id = %plan.user_id,
                    previous_tier = %plan.tier,
                    status = %plan.status,
                    "downgraded plan to free after grace period"
                );
            }
            Ok(false) => {}
            Err(err) => warn!(?err, user_id = %plan.user_id, "failed to downgrade lapsed plan"),
        }
    }

    report.free_balances_reset = sqlx::query(
        r#"
        UPDATE credit_balances b
        SET total_credits = $1, used_credits = 0, reset_at = $3, updated_at = $3
        FROM user_plans p
        WHERE p.user_id = b.user_id
          AND p.tier = 'free'
          AND b.reset_at < $2
        "#,
    )
    .bind(PlanTier::Free.limits().monthly_credits)
    .bind(start_of_utc_month(now))
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    report.events_pruned = sqlx::query("DELETE FROM billing_events WHERE processed_at < $1")
        .bind(now - Duration::days(retention_days))
        .execute(pool)
        .await?
        .rows_affected();

    let violations = BillingService::new(pool.clone()).integrity_report().await?;
    for violation in &violations {
        warn!(
            user_id = %violation.user_id,
            total_credits = violation.total_credits,
            used_credits = violation.used_credits,
            reason = %violation.reason,
            "credit integrity violation"
        );
    }
    report.integrity_violations = violations.len();

    Ok(report)
}

async fn downgrade_to_free(pool: &PgPool, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let mut tx = pool.begin().await?;
    // The subscription id is kept so a late recovery event still resolves the user.
    let updated = sqlx::query(
        r#"
        UPDATE user_plans
        SET tier = 'free', updated_at = $2
        WHERE user_id = $1 AND tier <> 'free'
        "#,
    )
    .bind(user_id)
    .bind(now)
    .execute(&mut tx)
    .await?
    .rows_affected();
    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    rescale_credits(&mut tx, user_id, PlanTier::Free).await?;
    tx.commit().await?;
    Ok(true)
}

pub fn start_of_utc_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[derive(Debug, FromRow)]
struct LapsedPlan {
    user_id: Uuid,
    tier: String,
    status: String,
}
