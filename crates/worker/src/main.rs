//! ClassMarket Background Worker
//!
//! Handles scheduled jobs including:
//! - Pending-subscription payment reconciliation (every 5 minutes)
//! - Renewal observation for active subscriptions (hourly)
//! - Matured downgrade application (hourly)
//! - Billing invariant checks (daily at 3:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use classmarket_billing::{BillingService, InvariantChecker, ReconcileRun};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Cap on distinct users examined per reconciliation pass.
const RECONCILE_USERS_PER_PASS: i64 = 200;
/// Cap on subscriptions examined per renewal or downgrade sweep.
const SWEEP_BATCH_LIMIT: i64 = 100;

async fn run_pending_reconciliation(billing: &BillingService) {
    match billing
        .reconciler
        .reconcile_all_pending(RECONCILE_USERS_PER_PASS)
        .await
    {
        Ok(ReconcileRun::Disabled) => {
            info!("Payment status polling is disabled; skipping pass");
        }
        Ok(ReconcileRun::Ran(summary)) => {
            info!(
                activated = summary.activated,
                cancelled = summary.cancelled,
                errors = summary.errors,
                skipped = summary.skipped,
                "Pending-subscription reconciliation pass complete"
            );
        }
        Err(e) => {
            error!(error = %e, "Pending-subscription reconciliation pass failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting ClassMarket Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If PayPlus isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without PayPlus integration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconcile pending subscriptions against PayPlus (every 5 minutes)
    // The gateway never calls back, so this polling is the only path from
    // 'pending' to 'active' or 'cancelled'.
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                info!("Running pending-subscription reconciliation");
                run_pending_reconciliation(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Pending-subscription reconciliation (every 5 minutes)");

    // Job 2: Observe renewals for overdue active subscriptions (hourly)
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running renewal reconciliation sweep");
                match billing.reconciler.reconcile_due_renewals(SWEEP_BATCH_LIMIT).await {
                    Ok(summary) => info!(
                        renewed = summary.renewed,
                        expired = summary.expired,
                        cancelled = summary.cancelled,
                        awaiting = summary.awaiting,
                        errors = summary.errors,
                        "Renewal sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Renewal sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal reconciliation sweep (hourly at :10)");

    // Job 3: Apply matured downgrades (hourly)
    let downgrade_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 40 * * * *", move |_uuid, _l| {
            let billing = downgrade_billing.clone();
            Box::pin(async move {
                info!("Running matured-downgrade sweep");
                match billing
                    .reconciler
                    .apply_matured_downgrades(SWEEP_BATCH_LIMIT)
                    .await
                {
                    Ok(summary) => info!(
                        downgrades_applied = summary.downgrades_applied,
                        errors = summary.errors,
                        "Matured-downgrade sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Matured-downgrade sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Matured-downgrade sweep (hourly at :40)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Job 5: Billing invariant checks (daily at 3:00 AM UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "ClassMarket Worker started successfully with {} scheduled jobs",
        5
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
