//! Mid-cycle plan change orchestration.
//!
//! Upgrades charge the prorated difference immediately and switch the plan in
//! the same request. Downgrades are scheduled: the new recurring amount is
//! registered with the gateway up front (the provider applies it from its own
//! next cycle) and the plan switch happens when the effective date passes.
//!
//! Ordering rule for upgrades: nothing is persisted until the external charge
//! has succeeded AND the gateway's recurring amount has been updated. A charge
//! failure aborts cleanly. A recurring-update failure after a successful
//! charge is the one state that cannot be rolled back remotely; it surfaces
//! as `BillingError::Consistency` and is logged for manual review.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, PaymentGateway};
use crate::model::{
    PendingPlanChange, PlanChangeRecord, Subscription, SubscriptionPlan, SubscriptionStatus,
};
use crate::proration::{
    self, ChangeType, DowngradeScheduling, PlanChangeReport, UpgradeProration,
};
use crate::store::{ChargeRecord, DowngradeCommit, SubscriptionStore, UpgradeCommit};

/// Result of a completed upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeOutcome {
    pub subscription: Subscription,
    pub proration: UpgradeProration,
    pub gateway_transaction_uid: String,
}

/// Result of a scheduled downgrade.
#[derive(Debug, Clone)]
pub struct DowngradeOutcome {
    pub subscription: Subscription,
    pub scheduling: DowngradeScheduling,
}

/// A candidate plan the user could move to, with a best-effort preview.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanChangeOption {
    pub plan: SubscriptionPlan,
    pub change_type: ChangeType,
    /// Prorated charge for upgrades; absent when the preview failed.
    pub prorated_amount: Option<Decimal>,
    /// Effective date for downgrades.
    pub effective_date: Option<OffsetDateTime>,
    pub report: PlanChangeReport,
}

/// Available plan changes for a user's active subscription.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AvailablePlanChanges {
    pub current_plan: SubscriptionPlan,
    pub upgrades: Vec<PlanChangeOption>,
    pub downgrades: Vec<PlanChangeOption>,
}

pub struct PlanChangeOrchestrator {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl PlanChangeOrchestrator {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: String,
    ) -> Self {
        Self {
            store,
            gateway,
            currency,
        }
    }

    /// Load the subscription (owner-scoped), both plans, and run the full
    /// eligibility report. Fails with every precondition problem at once.
    async fn load_and_validate(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        expected: ChangeType,
        now: OffsetDateTime,
    ) -> BillingResult<(Subscription, SubscriptionPlan, SubscriptionPlan)> {
        let subscription = self
            .store
            .subscription_for_user(user_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        let current_plan = self
            .store
            .plan(subscription.subscription_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "plan {}",
                    subscription.subscription_plan_id
                ))
            })?;

        let new_plan = self
            .store
            .plan(new_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", new_plan_id)))?;

        let report = proration::validate_plan_change(&subscription, &current_plan, &new_plan, now);
        if !report.valid {
            return Err(BillingError::NotEligible(report.errors.join("; ")));
        }
        if report.change_type != Some(expected) {
            let wanted = match expected {
                ChangeType::Upgrade => "an upgrade",
                ChangeType::Downgrade => "a downgrade",
            };
            return Err(BillingError::NotEligible(format!(
                "This plan change is not {}",
                wanted
            )));
        }

        Ok((subscription, current_plan, new_plan))
    }

    /// Upgrade to a more expensive plan mid-cycle.
    ///
    /// Charges the prorated difference via a stored payment token, updates
    /// the gateway's recurring amount, then persists the plan switch plus the
    /// proration transaction atomically.
    pub async fn upgrade_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        payment_method_id: Option<Uuid>,
    ) -> BillingResult<UpgradeOutcome> {
        let now = OffsetDateTime::now_utc();
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            new_plan_id = %new_plan_id,
            "Starting subscription upgrade"
        );

        let (subscription, current_plan, new_plan) = self
            .load_and_validate(user_id, subscription_id, new_plan_id, ChangeType::Upgrade, now)
            .await?;

        let proration =
            proration::calculate_upgrade_proration(&subscription, &current_plan, &new_plan, now)?;

        let payment_method = self
            .store
            .payment_method_for_user(user_id, payment_method_id)
            .await?
            .ok_or(BillingError::PaymentMethodRequired)?;

        // External side first: charge, then recurring update. Nothing local
        // is written until both have succeeded.
        let charge = self
            .gateway
            .charge_token(ChargeRequest {
                token: payment_method.token.clone(),
                amount: proration.prorated_amount,
                currency: self.currency.clone(),
                description: format!(
                    "Upgrade from {} to {} (prorated)",
                    current_plan.name, new_plan.name
                ),
                metadata: serde_json::json!({
                    "subscription_id": subscription_id,
                    "from_plan_id": current_plan.id,
                    "to_plan_id": new_plan.id,
                }),
            })
            .await?;

        if !charge.success {
            tracing::warn!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                status_code = %charge.status_code,
                "Upgrade proration charge declined"
            );
            return Err(BillingError::ChargeDeclined(
                charge.error.unwrap_or_else(|| {
                    format!("provider status code {}", charge.status_code)
                }),
            ));
        }

        // The subscription passed validation, so the UID is present.
        let recurring_uid = subscription
            .payplus_subscription_uid
            .clone()
            .ok_or_else(|| {
                BillingError::Internal("Validated subscription lost its recurring UID".to_string())
            })?;

        if let Err(e) = self
            .gateway
            .update_recurring_amount(
                &recurring_uid,
                new_plan.price,
                &format!("Upgrade to {}", new_plan.name),
            )
            .await
        {
            // Money moved but the recurring amount did not: manual review.
            let err = BillingError::Consistency {
                subscription_uid: recurring_uid,
                charged_amount: proration.prorated_amount,
                gateway_transaction_id: charge.transaction_id.clone(),
                cause: e.to_string(),
            };
            tracing::error!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                gateway_transaction_uid = %charge.transaction_id,
                charged_amount = %proration.prorated_amount,
                error = %e,
                "Upgrade charge succeeded but recurring amount update failed"
            );
            return Err(err);
        }

        let subscription = self
            .store
            .commit_upgrade(UpgradeCommit {
                subscription_id,
                expected_version: subscription.version,
                new_plan_id: new_plan.id,
                new_billing_price: new_plan.price,
                charge: ChargeRecord {
                    gateway_transaction_uid: charge.transaction_id.clone(),
                    amount: proration.prorated_amount,
                    currency: self.currency.clone(),
                    payment_method: payment_method.card_last_four.clone(),
                    provider_response: serde_json::json!({
                        "status_code": charge.status_code,
                        "transaction_uid": charge.transaction_id,
                    }),
                },
                last_plan_change: PlanChangeRecord::Upgrade {
                    from_plan_id: current_plan.id,
                    to_plan_id: new_plan.id,
                    prorated_amount: proration.prorated_amount,
                    changed_at: now,
                },
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            prorated_amount = %proration.prorated_amount,
            gateway_transaction_uid = %charge.transaction_id,
            "Subscription upgraded"
        );

        Ok(UpgradeOutcome {
            subscription,
            proration,
            gateway_transaction_uid: charge.transaction_id,
        })
    }

    /// Schedule a downgrade for the end of the current billing cycle.
    ///
    /// Nothing is charged. The gateway's recurring amount is lowered now so
    /// the provider's next cycle bills the new price; the local plan switch
    /// waits until the effective date passes.
    pub async fn downgrade_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<DowngradeOutcome> {
        let now = OffsetDateTime::now_utc();
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            new_plan_id = %new_plan_id,
            "Scheduling subscription downgrade"
        );

        let (subscription, current_plan, new_plan) = self
            .load_and_validate(
                user_id,
                subscription_id,
                new_plan_id,
                ChangeType::Downgrade,
                now,
            )
            .await?;

        let scheduling = proration::calculate_downgrade_scheduling(
            &subscription,
            &current_plan,
            &new_plan,
            now,
        )?;

        let recurring_uid = subscription
            .payplus_subscription_uid
            .clone()
            .ok_or_else(|| {
                BillingError::Internal("Validated subscription lost its recurring UID".to_string())
            })?;

        self.gateway
            .update_recurring_amount(
                &recurring_uid,
                new_plan.price,
                &format!("Scheduled downgrade to {}", new_plan.name),
            )
            .await?;

        let pending = PendingPlanChange {
            from_plan_id: current_plan.id,
            to_plan_id: new_plan.id,
            effective_date: scheduling.effective_date,
            scheduled_at: now,
            new_recurring_amount: new_plan.price,
        };

        let commit = self
            .store
            .schedule_downgrade(DowngradeCommit {
                subscription_id,
                expected_version: subscription.version,
                pending,
            })
            .await;

        let subscription = match commit {
            Ok(sub) => sub,
            Err(e) => {
                // The gateway already has the lowered amount. Best-effort
                // revert so a failed schedule does not underbill next cycle.
                if let Err(revert) = self
                    .gateway
                    .update_recurring_amount(
                        &recurring_uid,
                        subscription.billing_price,
                        "Revert failed downgrade scheduling",
                    )
                    .await
                {
                    tracing::error!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        recurring_uid = %recurring_uid,
                        error = %revert,
                        "Failed to revert recurring amount after downgrade scheduling failure"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            effective_date = %scheduling.effective_date,
            "Subscription downgrade scheduled"
        );

        Ok(DowngradeOutcome {
            subscription,
            scheduling,
        })
    }

    /// Cancel a pending downgrade before it takes effect.
    ///
    /// Restores the gateway's recurring amount to the current billing price
    /// first, then clears the pending change and records it in the audit
    /// trail.
    pub async fn cancel_pending_downgrade(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .subscription_for_user(user_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if subscription.metadata.pending_plan_change.is_none() {
            return Err(BillingError::Validation(
                "No pending plan change to cancel".to_string(),
            ));
        }

        if let Some(recurring_uid) = subscription.payplus_subscription_uid.as_deref() {
            self.gateway
                .update_recurring_amount(
                    recurring_uid,
                    subscription.billing_price,
                    "Pending downgrade cancelled",
                )
                .await?;
        }

        let subscription = self
            .store
            .cancel_pending_downgrade(subscription_id, subscription.version)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Pending downgrade cancelled"
        );

        Ok(subscription)
    }

    /// List the plans a user could change to, partitioned into upgrades and
    /// downgrades, each with a best-effort preview. Preview failures are
    /// reported per-candidate instead of failing the whole listing.
    pub async fn get_available_plan_changes(
        &self,
        user_id: Uuid,
    ) -> BillingResult<AvailablePlanChanges> {
        let now = OffsetDateTime::now_utc();

        let subscription = self
            .store
            .active_subscription_for_user(user_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotEligible("No active subscription".to_string())
            })?;
        debug_assert_eq!(subscription.status, SubscriptionStatus::Active);

        let current_plan = self
            .store
            .plan(subscription.subscription_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "plan {}",
                    subscription.subscription_plan_id
                ))
            })?;

        let mut upgrades = Vec::new();
        let mut downgrades = Vec::new();

        for plan in self.store.active_plans().await? {
            if plan.id == subscription.subscription_plan_id {
                continue;
            }

            let report = proration::validate_plan_change(&subscription, &current_plan, &plan, now);
            let Some(change_type) = report.change_type else {
                continue;
            };

            let option = match change_type {
                ChangeType::Upgrade => {
                    let prorated_amount = proration::calculate_upgrade_proration(
                        &subscription,
                        &current_plan,
                        &plan,
                        now,
                    )
                    .map(|p| p.prorated_amount)
                    .ok();
                    PlanChangeOption {
                        plan,
                        change_type,
                        prorated_amount,
                        effective_date: None,
                        report,
                    }
                }
                ChangeType::Downgrade => {
                    let effective_date = proration::calculate_downgrade_scheduling(
                        &subscription,
                        &current_plan,
                        &plan,
                        now,
                    )
                    .map(|s| s.effective_date)
                    .ok();
                    PlanChangeOption {
                        plan,
                        change_type,
                        prorated_amount: None,
                        effective_date,
                        report,
                    }
                }
            };

            match change_type {
                ChangeType::Upgrade => upgrades.push(option),
                ChangeType::Downgrade => downgrades.push(option),
            }
        }

        upgrades.sort_by(|a, b| a.plan.price.cmp(&b.plan.price));
        downgrades.sort_by(|a, b| b.plan.price.cmp(&a.plan.price));

        Ok(AvailablePlanChanges {
            current_plan,
            upgrades,
            downgrades,
        })
    }
}
