use aurion_backend::billing::BillingService;
use aurion_backend::config;
use dotenvy::dotenv;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(config::DATABASE_URL.as_str())
        .await?;

    let service = BillingService::new(pool);
    let violations = service.integrity_report().await?;
    let plans: Vec<_> = service
        .plan_counts()
        .await?
        .into_iter()
        .map(|(tier, status, count)| json!({ "tier": tier, "status": status, "count": count }))
        .collect();
    let processed_events = service.processed_event_count().await?;

    let summary = json!({
        "ok": violations.is_empty(),
        "violations": &violations,
        "plans": plans,
        "processed_billing_events": processed_events,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if violations.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{} credit integrity violation(s) found", violations.len());
        Ok(ExitCode::FAILURE)
    }
}
