use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::service::{rescale_credits, reset_credits};
use super::webhook::{BillingEvent, CheckoutCompleted, SubscriptionSnapshot};
use crate::plans::{PlanStatus, PlanTier};

/// What happened to a delivered billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// Event id was already processed; nothing changed.
    Duplicate,
    /// Recorded, but the event type carries no effect.
    Ignored,
    /// Recorded, but no local user could be matched.
    Unmatched,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Ignored => "ignored",
            ReconcileOutcome::Unmatched => "unmatched",
        }
    }
}

/// key: billing-reconciliation -> idempotent event application
///
/// The event id is claimed in the same transaction as its effect, so an event applies at
/// most once and a failed application leaves the id free for redelivery. `occurred_at` is
/// the platform's creation time; deliveries older than the last one applied to a plan are
/// recorded as ignored.
pub async fn apply_event(
    pool: &PgPool,
    event_id: &str,
    event_type: &str,
    payload: &Value,
    event: &BillingEvent,
    occurred_at: Option<DateTime<Utc>>,
) -> Result<ReconcileOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let claimed: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO billing_events (event_id, event_type, payload)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_id) DO NOTHING
        RETURNING event_id
        "#,
    )
    .bind(event_id)
    .bind(event_type)
    .bind(payload)
    .fetch_optional(&mut tx)
    .await?;

    if claimed.is_none() {
        tx.rollback().await?;
        info!(event_id, event_type, "billing event already processed");
        return Ok(ReconcileOutcome::Duplicate);
    }

    let outcome = match event {
        BillingEvent::CheckoutCompleted(checkout) => {
            apply_checkout(&mut tx, checkout, occurred_at).await?
        }
        BillingEvent::SubscriptionChanged(snapshot) => {
            apply_subscription_change(&mut tx, snapshot, occurred_at).await?
        }
        BillingEvent::SubscriptionDeleted(snapshot) => {
            apply_subscription_deleted(&mut tx, snapshot, occurred_at).await?
        }
        BillingEvent::PaymentFailed { subscription_id } => {
            set_subscription_status(&mut tx, subscription_id, PlanStatus::PastDue, occurred_at)
                .await?
        }
        BillingEvent::PaymentSucceeded { subscription_id } => {
            set_subscription_status(&mut tx, subscription_id, PlanStatus::Active, occurred_at)
                .await?
        }
        BillingEvent::Ignored => ReconcileOutcome::Ignored,
    };

    sqlx::query("UPDATE billing_events SET outcome = $2 WHERE event_id = $1")
        .bind(event_id)
        .bind(outcome.as_str())
        .execute(&mut tx)
        .await?;
    tx.commit().await?;

    match outcome {
        ReconcileOutcome::Unmatched => warn!(
            event_id,
            event_type,
            kind = event.kind(),
            "billing event did not match any user"
        ),
        _ => info!(
            event_id,
            event_type,
            kind = event.kind(),
            outcome = outcome.as_str(),
            "billing event reconciled"
        ),
    }
    Ok(outcome)
}

/// An event is stale when the plan already reflects a newer one.
fn is_stale(last_applied: Option<DateTime<Utc>>, occurred_at: Option<DateTime<Utc>>) -> bool {
    matches!((last_applied, occurred_at), (Some(last), Some(at)) if at < last)
}

/// Deleted subscriptions never come back; later updates for them are ignored.
async fn subscription_was_deleted(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM billing_events
            WHERE event_type = 'customer.subscription.deleted'
              AND payload #>> '{data,object,id}' = $1
        )
        "#,
    )
    .bind(subscription_id)
    .fetch_one(&mut *tx)
    .await
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    user_id: Uuid,
    tier: String,
    billing_subscription_id: Option<String>,
    current_period_start: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
}

impl PlanRow {
    fn tier(&self) -> PlanTier {
        self.tier.parse().unwrap_or(PlanTier::Free)
    }

    /// The plan carries a different live subscription than `subscription_id`.
    fn superseded_by_other(&self, subscription_id: &str) -> bool {
        self.billing_subscription_id
            .as_deref()
            .map_or(false, |current| current != subscription_id)
    }
}

async fn plan_by_user(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<Option<PlanRow>, sqlx::Error> {
    sqlx::query_as::<_, PlanRow>(
        r#"
        SELECT user_id, tier, billing_subscription_id, current_period_start, last_event_at
        FROM user_plans
        WHERE user_id = $1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await
}

async fn resolve_plan(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &SubscriptionSnapshot,
) -> Result<Option<PlanRow>, sqlx::Error> {
    if let Some(user_id) = snapshot.user_id {
        if let Some(row) = plan_by_user(tx, user_id).await? {
            return Ok(Some(row));
        }
    }
    if let Some(customer_id) = &snapshot.customer_id {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT p.user_id, p.tier, p.billing_subscription_id, p.current_period_start,
                   p.last_event_at
            FROM user_plans p
            JOIN profiles pr ON pr.id = p.user_id
            WHERE pr.billing_customer_id = $1
            FOR UPDATE OF p
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&mut *tx)
        .await?;
        if row.is_some() {
            return Ok(row);
        }
    }
    sqlx::query_as::<_, PlanRow>(
        r#"
        SELECT user_id, tier, billing_subscription_id, current_period_start, last_event_at
        FROM user_plans
        WHERE billing_subscription_id = $1
        FOR UPDATE
        "#,
    )
    .bind(&snapshot.subscription_id)
    .fetch_optional(&mut *tx)
    .await
}

async fn apply_checkout(
    tx: &mut Transaction<'_, Postgres>,
    checkout: &CheckoutCompleted,
    occurred_at: Option<DateTime<Utc>>,
) -> Result<ReconcileOutcome, sqlx::Error> {
    let user_id = checkout.user_id;
    let Some(current) = plan_by_user(tx, user_id).await? else {
        return Ok(ReconcileOutcome::Unmatched);
    };

    if let Some(customer_id) = &checkout.customer_id {
        sqlx::query(
            "UPDATE profiles SET billing_customer_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE billing_sessions SET status = 'complete', completed_at = NOW() WHERE id = $1",
    )
    .bind(&checkout.session_id)
    .execute(&mut *tx)
    .await?;

    if is_stale(current.last_event_at, occurred_at) {
        info!(
            %user_id,
            session_id = %checkout.session_id,
            "skipping checkout older than plan state"
        );
        return Ok(ReconcileOutcome::Ignored);
    }
    if let Some(subscription_id) = &checkout.subscription_id {
        if subscription_was_deleted(tx, subscription_id).await? {
            info!(%user_id, %subscription_id, "skipping checkout for a deleted subscription");
            return Ok(ReconcileOutcome::Ignored);
        }
    }

    // A subscription event may arrive first and already carry the same plan; the tier is
    // activated either way but credits are only granted once.
    let mirrored = current.tier == checkout.tier.as_str()
        && current.billing_subscription_id.is_some()
        && current.billing_subscription_id == checkout.subscription_id;

    sqlx::query(
        r#"
        UPDATE user_plans
        SET tier = $2,
            status = 'active',
            billing_subscription_id = COALESCE($3, billing_subscription_id),
            current_period_start = COALESCE(current_period_start, NOW()),
            last_event_at = GREATEST(last_event_at, $4),
            updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(checkout.tier.as_str())
    .bind(checkout.subscription_id.as_deref())
    .bind(occurred_at)
    .execute(&mut *tx)
    .await?;

    if !mirrored {
        reset_credits(&mut *tx, user_id, checkout.tier).await?;
    }

    Ok(ReconcileOutcome::Applied)
}

async fn apply_subscription_change(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &SubscriptionSnapshot,
    occurred_at: Option<DateTime<Utc>>,
) -> Result<ReconcileOutcome, sqlx::Error> {
    let Some(current) = resolve_plan(tx, snapshot).await? else {
        return Ok(ReconcileOutcome::Unmatched);
    };
    let subscription_id = snapshot.subscription_id.as_str();

    if is_stale(current.last_event_at, occurred_at) {
        info!(
            user_id = %current.user_id,
            subscription_id,
            "skipping subscription update older than plan state"
        );
        return Ok(ReconcileOutcome::Ignored);
    }
    if subscription_was_deleted(tx, subscription_id).await? {
        info!(
            user_id = %current.user_id,
            subscription_id,
            "skipping update for a deleted subscription"
        );
        return Ok(ReconcileOutcome::Ignored);
    }
    // Another subscription is current; only a live one may take its place.
    let switched = current.superseded_by_other(subscription_id);
    if switched && !snapshot.status.grants_access() {
        info!(
            user_id = %current.user_id,
            subscription_id,
            "skipping update for a superseded subscription"
        );
        return Ok(ReconcileOutcome::Ignored);
    }

    let previous_tier = current.tier();
    let next_tier = snapshot.tier.unwrap_or(previous_tier);

    sqlx::query(
        r#"
        UPDATE user_plans
        SET tier = $2,
            status = $3,
            billing_subscription_id = $4,
            current_period_start = COALESCE($5, current_period_start),
            current_period_end = COALESCE($6, current_period_end),
            last_event_at = GREATEST(last_event_at, $7),
            updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(current.user_id)
    .bind(next_tier.as_str())
    .bind(snapshot.status.as_str())
    .bind(subscription_id)
    .bind(snapshot.current_period_start)
    .bind(snapshot.current_period_end)
    .bind(occurred_at)
    .execute(&mut *tx)
    .await?;

    if let Some(customer_id) = &snapshot.customer_id {
        sqlx::query(
            r#"
            UPDATE profiles SET billing_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND billing_customer_id IS DISTINCT FROM $2
            "#,
        )
        .bind(current.user_id)
        .bind(customer_id)
        .execute(&mut *tx)
        .await?;
    }

    let renewed = switched
        || match (snapshot.current_period_start, current.current_period_start) {
            (Some(next), Some(previous)) => next > previous,
            (Some(_), None) => true,
            _ => false,
        };

    if renewed || next_tier > previous_tier {
        reset_credits(&mut *tx, current.user_id, next_tier).await?;
    } else if next_tier < previous_tier {
        rescale_credits(&mut *tx, current.user_id, next_tier).await?;
    }

    Ok(ReconcileOutcome::Applied)
}

async fn apply_subscription_deleted(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &SubscriptionSnapshot,
    occurred_at: Option<DateTime<Utc>>,
) -> Result<ReconcileOutcome, sqlx::Error> {
    let Some(current) = resolve_plan(tx, snapshot).await? else {
        return Ok(ReconcileOutcome::Unmatched);
    };
    let subscription_id = snapshot.subscription_id.as_str();

    // Deleting a superseded subscription leaves the current one alone.
    if current.superseded_by_other(subscription_id) {
        info!(
            user_id = %current.user_id,
            subscription_id,
            "ignoring deletion of a superseded subscription"
        );
        return Ok(ReconcileOutcome::Ignored);
    }
    if current.billing_subscription_id.is_none() && current.tier() == PlanTier::Free {
        return Ok(ReconcileOutcome::Ignored);
    }

    sqlx::query(
        r#"
        UPDATE user_plans
        SET tier = 'free',
            status = 'canceled',
            billing_subscription_id = NULL,
            current_period_start = NULL,
            current_period_end = NULL,
            last_event_at = GREATEST(last_event_at, $2),
            updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(current.user_id)
    .bind(occurred_at)
    .execute(&mut *tx)
    .await?;

    rescale_credits(&mut *tx, current.user_id, PlanTier::Free).await?;
    Ok(ReconcileOutcome::Applied)
}

async fn set_subscription_status(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: &str,
    status: PlanStatus,
    occurred_at: Option<DateTime<Utc>>,
) -> Result<ReconcileOutcome, sqlx::Error> {
    let current = sqlx::query_as::<_, PlanRow>(
        r#"
        SELECT user_id, tier, billing_subscription_id, current_period_start, last_event_at
        FROM user_plans
        WHERE billing_subscription_id = $1
        FOR UPDATE
        "#,
    )
    .bind(subscription_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(current) = current else {
        return Ok(ReconcileOutcome::Unmatched);
    };
    if is_stale(current.last_event_at, occurred_at) {
        info!(
            user_id = %current.user_id,
            subscription_id,
            "skipping invoice event older than plan state"
        );
        return Ok(ReconcileOutcome::Ignored);
    }

    sqlx::query(
        r#"
        UPDATE user_plans
        SET status = $2, last_event_at = GREATEST(last_event_at, $3), updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(current.user_id)
    .bind(status.as_str())
    .bind(occurred_at)
    .execute(&mut *tx)
    .await?;
    Ok(ReconcileOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(seconds, 0).single()
    }

    #[test]
    fn older_events_are_stale() {
        assert!(is_stale(at(2_000), at(1_000)));
        assert!(!is_stale(at(2_000), at(2_000)));
        assert!(!is_stale(at(1_000), at(2_000)));
    }

    #[test]
    fn undated_events_are_never_stale() {
        assert!(!is_stale(None, at(1_000)));
        assert!(!is_stale(at(1_000), None));
    }

    #[test]
    fn only_a_different_live_subscription_supersedes() {
        let row = |subscription: Option<&str>| PlanRow {
            user_id: Uuid::new_v4(),
            tier: "pro".into(),
            billing_subscription_id: subscription.map(str::to_string),
            current_period_start: None,
            last_event_at: None,
        };
        assert!(row(Some("sub_2")).superseded_by_other("sub_1"));
        assert!(!row(Some("sub_1")).superseded_by_other("sub_1"));
        assert!(!row(None).superseded_by_other("sub_1"));
    }
}
