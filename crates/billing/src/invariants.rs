//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the subscription core.
//! These invariants can be run after any mutation or reconciliation sweep to
//! ensure the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for cancelled-without-reason violation
#[derive(Debug, sqlx::FromRow)]
struct CancelledNoReasonRow {
    sub_id: Uuid,
    user_id: Uuid,
    status: String,
}

/// Row type for active subscriptions missing provider linkage
#[derive(Debug, sqlx::FromRow)]
struct UnlinkedActiveRow {
    sub_id: Uuid,
    user_id: Uuid,
    missing_uid: bool,
    missing_next_billing: bool,
}

/// Row type for stale pending-change violation
#[derive(Debug, sqlx::FromRow)]
struct StalePendingChangeRow {
    sub_id: Uuid,
    user_id: Uuid,
    status: String,
    effective_date: Option<String>,
}

/// Row type for completed transactions missing the external UID
#[derive(Debug, sqlx::FromRow)]
struct UntracedTransactionRow {
    transaction_id: Uuid,
    user_id: Uuid,
    transaction_type: String,
}

/// Row type for plan changes missing audit records
#[derive(Debug, sqlx::FromRow)]
struct UnauditedPlanChangeRow {
    sub_id: Uuid,
    user_id: Uuid,
    change_type: Option<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_cancelled_has_reason().await?);
        violations.extend(self.check_active_linked_to_provider().await?);
        violations.extend(self.check_pending_change_on_active_only().await?);
        violations.extend(self.check_completed_transactions_traced().await?);
        violations.extend(self.check_plan_changes_audited().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 active subscription per user
    ///
    /// Having multiple active subscriptions would cause double-billing
    /// and entitlement confusion.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Cancelled subscriptions record a reason
    ///
    /// Every cancellation goes through a path that supplies a reason
    /// (user-requested, payment_failed, payplus_page_abandoned). A missing
    /// reason means some code path bypassed the store.
    async fn check_cancelled_has_reason(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledNoReasonRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id, s.status
            FROM subscriptions s
            WHERE s.status = 'cancelled'
              AND (s.cancellation_reason IS NULL OR s.cancellation_reason = '')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_reason".to_string(),
                user_ids: vec![row.user_id],
                description: "Cancelled subscription has no cancellation reason".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Active subscriptions are linked to the provider
    ///
    /// An active subscription without a recurring UID cannot be renewed or
    /// reconciled; one without a next billing date can never end its cycle.
    async fn check_active_linked_to_provider(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnlinkedActiveRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                (s.payplus_subscription_uid IS NULL) as missing_uid,
                (s.next_billing_date IS NULL) as missing_next_billing
            FROM subscriptions s
            WHERE s.status = 'active'
              AND (s.payplus_subscription_uid IS NULL OR s.next_billing_date IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_linked_to_provider".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription is missing provider linkage".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "missing_recurring_uid": row.missing_uid,
                    "missing_next_billing_date": row.missing_next_billing,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Pending plan changes live only on active subscriptions
    ///
    /// A pending change on a cancelled or expired subscription will never be
    /// applied and indicates a cancellation path that skipped cleanup.
    async fn check_pending_change_on_active_only(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingChangeRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                s.status,
                s.metadata -> 'pending_plan_change' ->> 'effective_date' as effective_date
            FROM subscriptions s
            WHERE s.metadata ? 'pending_plan_change'
              AND s.status != 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_change_on_active_only".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription in status '{}' still carries a pending plan change",
                    row.status
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "status": row.status,
                    "effective_date": row.effective_date,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Completed transactions carry the external UID
    ///
    /// The external transaction UID is the idempotency key for renewal
    /// recording; a completed transaction without one cannot be traced back
    /// to the provider.
    async fn check_completed_transactions_traced(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UntracedTransactionRow> = sqlx::query_as(
            r#"
            SELECT t.id as transaction_id, t.user_id, t.transaction_type
            FROM transactions t
            WHERE t.payment_status = 'completed'
              AND t.payplus_transaction_uid IS NULL
              AND t.subscription_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_transactions_traced".to_string(),
                user_ids: vec![row.user_id],
                description: "Completed transaction has no provider transaction UID".to_string(),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "transaction_type": row.transaction_type,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Applied plan changes have history records
    ///
    /// Every applied plan change should be visible in the subscription
    /// history for support and debugging.
    async fn check_plan_changes_audited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnauditedPlanChangeRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                s.metadata -> 'last_plan_change' ->> 'type' as change_type
            FROM subscriptions s
            WHERE s.metadata ? 'last_plan_change'
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_history h
                  WHERE h.subscription_id = s.id
                    AND h.event IN ('upgraded', 'downgraded')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_changes_audited".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription records a '{}' plan change with no history record",
                    row.change_type.as_deref().unwrap_or("(unknown)")
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "change_type": row.change_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "cancelled_has_reason" => self.check_cancelled_has_reason().await,
            "active_linked_to_provider" => self.check_active_linked_to_provider().await,
            "pending_change_on_active_only" => self.check_pending_change_on_active_only().await,
            "completed_transactions_traced" => self.check_completed_transactions_traced().await,
            "plan_changes_audited" => self.check_plan_changes_audited().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "cancelled_has_reason",
            "active_linked_to_provider",
            "pending_change_on_active_only",
            "completed_transactions_traced",
            "plan_changes_audited",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"plan_changes_audited"));
    }
}
