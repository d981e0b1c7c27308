//! Polling-based payment status reconciliation.
//!
//! The gateway never calls back. Pending subscriptions are resolved by
//! querying the provider's transaction history for the hosted payment page,
//! with the recurring-charge history as a fallback once a recurring UID is
//! known. The fallback is authoritative when both answer: a recorded
//! recurring charge proves the page completed even if the page history is
//! lagging.
//!
//! A gateway error never cancels anything. Only a positively observed
//! failure, or running out of polling attempts, moves a pending subscription
//! to `cancelled`.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayTransaction, PaymentGateway, RecurringCharge};
use crate::model::{Subscription, SubscriptionStatus};
use crate::store::{ActivateCommit, CancelCommit, RenewalRecord, SubscriptionStore};

/// Cancellation reason recorded when the payment page was never completed.
pub const REASON_PAGE_ABANDONED: &str = "payplus_page_abandoned";
/// Cancellation reason recorded when the provider reported a failed charge.
pub const REASON_PAYMENT_FAILED: &str = "payment_failed";
/// Expiry reason recorded when a renewal charge failed.
pub const REASON_RENEWAL_FAILED: &str = "renewal_payment_failed";

/// What the provider's records say about a hosted payment page.
#[derive(Debug, Clone)]
pub enum PageStatus {
    /// No transaction observed yet and attempts remain.
    PendingProcessing,
    /// No transaction observed and the attempt budget is exhausted.
    Abandoned,
    /// A successful transaction exists.
    Completed(GatewayTransaction),
    /// Only failed transactions exist.
    Failed(GatewayTransaction),
}

/// Result of reconciling one pending subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Activated,
    Cancelled,
    StillPending,
    /// Missing page UID or otherwise unreconcilable; left untouched.
    Skipped,
}

/// Result of reconciling one active subscription's renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    /// Cycle ended with `cancel_at_period_end` set.
    Cancelled,
    /// Renewal charge failed; subscription expired.
    Expired,
    /// Cycle ended but the provider shows no new charge yet.
    AwaitingCharge,
}

/// Counters for a batch reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub activated: usize,
    pub cancelled: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Result of a per-user batch call, honoring the kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRun {
    /// Polling is disabled by configuration; nothing was examined.
    Disabled,
    Ran(ReconcileSummary),
}

/// Counters for a renewal sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSweepSummary {
    pub renewed: usize,
    pub expired: usize,
    pub cancelled: usize,
    pub awaiting: usize,
    pub downgrades_applied: usize,
    pub errors: usize,
}

pub struct PaymentStatusReconciler {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: ReconcileConfig,
}

impl PaymentStatusReconciler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Query the payment-page transaction history and classify it.
    ///
    /// Bumps the persisted attempt counter only when nothing was observed;
    /// once the budget is exhausted the page counts as abandoned.
    pub async fn check_payment_page_status(
        &self,
        subscription: &Subscription,
        page_request_uid: &str,
    ) -> BillingResult<PageStatus> {
        let transactions = self
            .gateway
            .query_transaction_history(page_request_uid)
            .await?;

        let matching: Vec<&GatewayTransaction> = transactions
            .iter()
            .filter(|t| {
                // An entry with no page reference cannot be attributed to
                // this page; never act on it.
                t.payment_page_payment_request
                    .as_ref()
                    .map(|p| p.uuid == page_request_uid)
                    .unwrap_or(false)
            })
            .collect();

        if let Some(success) = matching.iter().find(|t| t.is_success()) {
            return Ok(PageStatus::Completed((*success).clone()));
        }

        if let Some(failed) = matching.last() {
            return Ok(PageStatus::Failed((*failed).clone()));
        }

        let attempts = self
            .store
            .bump_status_check_attempts(subscription.id)
            .await?;

        if attempts as u32 >= self.config.max_status_attempts {
            tracing::warn!(
                subscription_id = %subscription.id,
                attempts,
                "Payment page polling budget exhausted"
            );
            Ok(PageStatus::Abandoned)
        } else {
            tracing::debug!(
                subscription_id = %subscription.id,
                attempts,
                max_attempts = self.config.max_status_attempts,
                "Payment page still pending"
            );
            Ok(PageStatus::PendingProcessing)
        }
    }

    /// Reconcile one pending subscription end to end.
    ///
    /// Primary source is the payment-page history; when a recurring UID is
    /// already known, the recurring-charge history is consulted too and a
    /// successful charge there wins over a stale page result.
    pub async fn check_and_handle(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<ReconcileOutcome> {
        if subscription.status != SubscriptionStatus::Pending {
            return Ok(ReconcileOutcome::Skipped);
        }

        let initial = self.store.initial_transaction(subscription.id).await?;
        let Some(page_request_uid) = initial.and_then(|t| t.payment_page_request_uid) else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Pending subscription has no payment page UID; skipping"
            );
            return Ok(ReconcileOutcome::Skipped);
        };

        let mut status = self
            .check_payment_page_status(subscription, &page_request_uid)
            .await?;

        if let Some(recurring_uid) = subscription.payplus_subscription_uid.as_deref() {
            match self.gateway.query_recurring_charges(recurring_uid).await {
                Ok(charges) => {
                    if let Some(charge) = charges.iter().rev().find(|c| c.is_success()) {
                        status = PageStatus::Completed(GatewayTransaction {
                            uuid: charge.transaction_uid.clone(),
                            information: crate::gateway::GatewayTransactionInfo {
                                status_code: charge.status_code.clone(),
                                amount_by_currency: Some(charge.amount),
                                transaction_at: charge.charged_at.clone(),
                            },
                            payment_page_payment_request: None,
                            recurring_uid: Some(recurring_uid.to_string()),
                        });
                    }
                }
                Err(e) => {
                    // Fallback failure is not fatal; the page result stands.
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "Recurring-charge fallback query failed"
                    );
                }
            }
        }

        match status {
            PageStatus::Completed(transaction) => {
                self.activate_from_transaction(subscription, transaction)
                    .await?;
                Ok(ReconcileOutcome::Activated)
            }
            PageStatus::Failed(transaction) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    status_code = %transaction.information.status_code,
                    "Cancelling pending subscription after failed charge"
                );
                self.store
                    .cancel(CancelCommit {
                        subscription_id: subscription.id,
                        expected_version: subscription.version,
                        reason: REASON_PAYMENT_FAILED.to_string(),
                        at_period_end: false,
                    })
                    .await?;
                Ok(ReconcileOutcome::Cancelled)
            }
            PageStatus::Abandoned => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    "Cancelling abandoned pending subscription"
                );
                self.store
                    .cancel(CancelCommit {
                        subscription_id: subscription.id,
                        expected_version: subscription.version,
                        reason: REASON_PAGE_ABANDONED.to_string(),
                        at_period_end: false,
                    })
                    .await?;
                Ok(ReconcileOutcome::Cancelled)
            }
            PageStatus::PendingProcessing => Ok(ReconcileOutcome::StillPending),
        }
    }

    async fn activate_from_transaction(
        &self,
        subscription: &Subscription,
        transaction: GatewayTransaction,
    ) -> BillingResult<()> {
        let plan = self
            .store
            .plan(subscription.subscription_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("plan {}", subscription.subscription_plan_id))
            })?;

        let now = OffsetDateTime::now_utc();
        let next_billing_date = plan.billing_period.advance(now);

        let provider_response = serde_json::to_value(&transaction).ok();

        self.store
            .activate(ActivateCommit {
                subscription_id: subscription.id,
                expected_version: subscription.version,
                payplus_subscription_uid: transaction
                    .recurring_uid
                    .clone()
                    .or_else(|| subscription.payplus_subscription_uid.clone()),
                gateway_transaction_uid: Some(transaction.uuid.clone()),
                provider_response,
                start_date: now,
                next_billing_date,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            gateway_transaction_uid = %transaction.uuid,
            next_billing_date = %next_billing_date,
            "Subscription activated from observed payment"
        );
        Ok(())
    }

    /// Reconcile all pending subscriptions of one user, capped at the batch
    /// limit. The kill switch is checked once per call; individual failures
    /// are counted and never abort the batch.
    pub async fn check_user_pending_subscriptions(
        &self,
        user_id: Uuid,
    ) -> BillingResult<ReconcileRun> {
        if !self.config.polling_enabled {
            tracing::debug!(user_id = %user_id, "Payment status polling is disabled");
            return Ok(ReconcileRun::Disabled);
        }

        let pending = self
            .store
            .pending_subscriptions_for_user(user_id, self.config.batch_limit)
            .await?;

        let mut summary = ReconcileSummary::default();
        for subscription in &pending {
            match self.check_and_handle(subscription).await {
                Ok(ReconcileOutcome::Activated) => summary.activated += 1,
                Ok(ReconcileOutcome::Cancelled) => summary.cancelled += 1,
                Ok(ReconcileOutcome::Skipped) => summary.skipped += 1,
                Ok(ReconcileOutcome::StillPending) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        user_id = %user_id,
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to reconcile pending subscription"
                    );
                }
            }
        }

        if summary != ReconcileSummary::default() {
            tracing::info!(
                user_id = %user_id,
                activated = summary.activated,
                cancelled = summary.cancelled,
                errors = summary.errors,
                skipped = summary.skipped,
                "Reconciled pending subscriptions"
            );
        }
        Ok(ReconcileRun::Ran(summary))
    }

    /// Reconcile pending subscriptions across all users, capped at
    /// `user_limit` distinct users. Entry point for the background worker.
    pub async fn reconcile_all_pending(&self, user_limit: i64) -> BillingResult<ReconcileRun> {
        if !self.config.polling_enabled {
            tracing::debug!("Payment status polling is disabled");
            return Ok(ReconcileRun::Disabled);
        }

        let users = self.store.users_with_pending_subscriptions(user_limit).await?;

        let mut total = ReconcileSummary::default();
        for user_id in users {
            match self.check_user_pending_subscriptions(user_id).await {
                Ok(ReconcileRun::Ran(summary)) => {
                    total.activated += summary.activated;
                    total.cancelled += summary.cancelled;
                    total.errors += summary.errors;
                    total.skipped += summary.skipped;
                }
                Ok(ReconcileRun::Disabled) => return Ok(ReconcileRun::Disabled),
                Err(e) => {
                    total.errors += 1;
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to reconcile user's pending subscriptions"
                    );
                }
            }
        }
        Ok(ReconcileRun::Ran(total))
    }

    /// Reconcile one active subscription whose billing date has passed.
    ///
    /// Order matters: a matured pending downgrade is applied first so the
    /// recorded renewal carries the post-downgrade plan and price. Then the
    /// recurring-charge history decides between advancing the cycle,
    /// expiring, or waiting.
    pub async fn reconcile_renewal(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<RenewalOutcome> {
        let now = OffsetDateTime::now_utc();
        if subscription.status != SubscriptionStatus::Active || subscription.cycle_is_open(now) {
            return Ok(RenewalOutcome::AwaitingCharge);
        }

        let mut subscription = subscription.clone();

        if let Some(pending) = subscription.metadata.pending_plan_change.clone() {
            if pending.effective_date <= now {
                subscription = self
                    .store
                    .apply_pending_downgrade(subscription.id, subscription.version)
                    .await?;
                tracing::info!(
                    subscription_id = %subscription.id,
                    to_plan_id = %pending.to_plan_id,
                    "Applied matured downgrade before renewal"
                );
            }
        }

        if subscription.cancel_at_period_end {
            let reason = subscription
                .cancellation_reason
                .clone()
                .unwrap_or_else(|| "cancelled_at_period_end".to_string());
            self.store
                .cancel(CancelCommit {
                    subscription_id: subscription.id,
                    expected_version: subscription.version,
                    reason,
                    at_period_end: false,
                })
                .await?;
            return Ok(RenewalOutcome::Cancelled);
        }

        let Some(recurring_uid) = subscription.payplus_subscription_uid.clone() else {
            return Ok(RenewalOutcome::AwaitingCharge);
        };

        let charges = self.gateway.query_recurring_charges(&recurring_uid).await?;
        let Some(latest) = charges.last() else {
            return Ok(RenewalOutcome::AwaitingCharge);
        };

        self.record_renewal(&subscription, latest).await?;

        if latest.is_success() {
            // Advance even when the charge was already recorded: reaching
            // this point with a closed cycle means an earlier pass stopped
            // between recording the charge and moving the billing date.
            let plan = self
                .store
                .plan(subscription.subscription_plan_id)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("plan {}", subscription.subscription_plan_id))
                })?;
            let from = subscription.next_billing_date.unwrap_or(now);
            let next = plan.billing_period.advance(from);

            self.store
                .mark_renewed(subscription.id, subscription.version, next)
                .await?;
            tracing::info!(
                subscription_id = %subscription.id,
                next_billing_date = %next,
                "Subscription renewed"
            );
            Ok(RenewalOutcome::Renewed)
        } else {
            tracing::warn!(
                subscription_id = %subscription.id,
                status_code = %latest.status_code,
                "Renewal charge failed; expiring subscription"
            );
            self.store
                .expire(
                    subscription.id,
                    subscription.version,
                    REASON_RENEWAL_FAILED.to_string(),
                )
                .await?;
            Ok(RenewalOutcome::Expired)
        }
    }

    /// Record an observed recurring charge. Re-observing a known external
    /// transaction UID is an idempotent no-op.
    async fn record_renewal(
        &self,
        subscription: &Subscription,
        charge: &RecurringCharge,
    ) -> BillingResult<()> {
        self.store
            .record_renewal_transaction(RenewalRecord {
                subscription_id: subscription.id,
                user_id: subscription.user_id,
                gateway_transaction_uid: charge.transaction_uid.clone(),
                amount: charge.amount,
                currency: "ILS".to_string(),
                success: charge.is_success(),
                status_code: charge.status_code.clone(),
                provider_response: serde_json::to_value(charge)
                    .unwrap_or(serde_json::Value::Null),
            })
            .await?;
        Ok(())
    }

    /// Sweep active subscriptions whose billing date has passed and
    /// reconcile each renewal. Used by the background worker.
    pub async fn reconcile_due_renewals(&self, limit: i64) -> BillingResult<RenewalSweepSummary> {
        let now = OffsetDateTime::now_utc();
        let due = self
            .store
            .active_subscriptions_due_for_renewal(now, limit)
            .await?;

        let mut summary = RenewalSweepSummary::default();
        for subscription in &due {
            match self.reconcile_renewal(subscription).await {
                Ok(RenewalOutcome::Renewed) => summary.renewed += 1,
                Ok(RenewalOutcome::Expired) => summary.expired += 1,
                Ok(RenewalOutcome::Cancelled) => summary.cancelled += 1,
                Ok(RenewalOutcome::AwaitingCharge) => summary.awaiting += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to reconcile renewal"
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Sweep active subscriptions with a matured pending downgrade and apply
    /// it, independent of renewal timing.
    pub async fn apply_matured_downgrades(&self, limit: i64) -> BillingResult<RenewalSweepSummary> {
        let now = OffsetDateTime::now_utc();
        let matured = self
            .store
            .subscriptions_with_matured_downgrades(now, limit)
            .await?;

        let mut summary = RenewalSweepSummary::default();
        for subscription in &matured {
            match self
                .store
                .apply_pending_downgrade(subscription.id, subscription.version)
                .await
            {
                Ok(updated) => {
                    summary.downgrades_applied += 1;
                    tracing::info!(
                        subscription_id = %updated.id,
                        plan_id = %updated.subscription_plan_id,
                        "Applied matured downgrade"
                    );
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to apply matured downgrade"
                    );
                }
            }
        }
        Ok(summary)
    }
}
