//! Subscription lifecycle facade.
//!
//! `SubscriptionLifecycleService` covers the signup-to-cancellation path:
//! creating hosted payment requests, reading the current state, and
//! cancelling. Plan changes and reconciliation live in their own components;
//! `BillingService` bundles all three behind one constructor.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{PayPlusConfig, ReconcileConfig};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, PaymentPageRequest};
use crate::model::{
    Subscription, SubscriptionHistoryRecord, SubscriptionPlan, SubscriptionStatus,
};
use crate::payplus::PayPlusClient;
use crate::plan_change::PlanChangeOrchestrator;
use crate::postgres::PgSubscriptionStore;
use crate::reconcile::{PaymentStatusReconciler, ReconcileRun};
use crate::store::{CancelCommit, NewPendingSubscription, SubscriptionStore};

/// A created payment request the user must complete at the hosted page.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub subscription: Subscription,
    pub payment_url: String,
    pub page_request_uid: String,
}

/// A subscription joined with its plan.
#[derive(Debug, Clone)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
}

pub struct SubscriptionLifecycleService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl SubscriptionLifecycleService {
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

    /// Check whether a user may start a subscription to `plan_id`.
    pub async fn validate_eligibility(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<SubscriptionPlan> {
        let plan = self
            .store
            .plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;

        if !plan.is_active {
            return Err(BillingError::NotEligible(
                "This plan is no longer available".to_string(),
            ));
        }

        if self
            .store
            .active_subscription_for_user(user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::NotEligible(
                "An active subscription already exists. Change plans instead of subscribing again."
                    .to_string(),
            ));
        }

        if !self
            .store
            .pending_subscriptions_for_user(user_id, 1)
            .await?
            .is_empty()
        {
            return Err(BillingError::NotEligible(
                "A subscription payment is already awaiting confirmation.".to_string(),
            ));
        }

        Ok(plan)
    }

    /// Start a new subscription: create the hosted payment page, then a
    /// `pending` subscription plus its initial pending transaction. The
    /// subscription activates only when reconciliation observes the payment.
    pub async fn create_payment_request(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<PaymentRequest> {
        let plan = self.validate_eligibility(user_id, plan_id).await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            plan = %plan.name,
            "Creating subscription payment request"
        );

        let page = self
            .gateway
            .create_payment_page(PaymentPageRequest {
                amount: plan.price,
                currency: self.currency.clone(),
                description: format!("Subscription: {}", plan.name),
                customer_reference: user_id.to_string(),
                recurring_interval: plan.billing_period.as_str().to_string(),
            })
            .await?;

        let subscription = self
            .store
            .create_pending_subscription(NewPendingSubscription {
                user_id,
                plan_id,
                billing_price: plan.price,
                original_price: plan.price,
                currency: self.currency.clone(),
                page_request_uid: page.page_request_uid.clone(),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            page_request_uid = %page.page_request_uid,
            "Pending subscription created"
        );

        Ok(PaymentRequest {
            subscription,
            payment_url: page.payment_url,
            page_request_uid: page.page_request_uid,
        })
    }

    /// Cancel a subscription.
    ///
    /// `at_period_end` keeps the subscription active through the already-paid
    /// cycle; otherwise it is cancelled immediately. Either way the gateway's
    /// recurring charging stops now.
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        reason: Option<String>,
        at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .subscription_for_user(user_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        match subscription.status {
            SubscriptionStatus::Active | SubscriptionStatus::Pending => {}
            other => {
                return Err(BillingError::Validation(format!(
                    "Cannot cancel a {} subscription",
                    other
                )));
            }
        }

        if let Some(recurring_uid) = subscription.payplus_subscription_uid.as_deref() {
            self.gateway.cancel_recurring(recurring_uid).await?;
        }

        let reason = reason.unwrap_or_else(|| "user_requested".to_string());
        // A pending subscription has no paid cycle to honor
        let at_period_end = at_period_end && subscription.status == SubscriptionStatus::Active;

        let subscription = self
            .store
            .cancel(CancelCommit {
                subscription_id,
                expected_version: subscription.version,
                reason: reason.clone(),
                at_period_end,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            reason = %reason,
            at_period_end,
            "Subscription cancelled"
        );

        Ok(subscription)
    }

    /// The user's active subscription with its plan, if any.
    pub async fn current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionView>> {
        let Some(subscription) = self.store.active_subscription_for_user(user_id).await? else {
            return Ok(None);
        };

        let plan = self
            .store
            .plan(subscription.subscription_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("plan {}", subscription.subscription_plan_id))
            })?;

        Ok(Some(SubscriptionView { subscription, plan }))
    }

    /// The user's subscription audit trail, most recent first.
    pub async fn subscription_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryRecord>> {
        self.store.history_for_user(user_id, limit).await
    }

    /// Plans currently open for signup.
    pub async fn available_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        self.store.active_plans().await
    }
}

/// Aggregate of the three subscription components, sharing one store and one
/// gateway client.
pub struct BillingService {
    pub lifecycle: SubscriptionLifecycleService,
    pub plan_changes: PlanChangeOrchestrator,
    pub reconciler: PaymentStatusReconciler,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: String,
        reconcile_config: ReconcileConfig,
    ) -> Self {
        Self {
            lifecycle: SubscriptionLifecycleService::new(
                Arc::clone(&store),
                Arc::clone(&gateway),
                currency.clone(),
            ),
            plan_changes: PlanChangeOrchestrator::new(
                Arc::clone(&store),
                Arc::clone(&gateway),
                currency,
            ),
            reconciler: PaymentStatusReconciler::new(store, gateway, reconcile_config),
        }
    }

    /// Success-return hook: the user came back from the hosted payment
    /// page, so poll their pending subscriptions now instead of waiting for
    /// the next scheduled pass.
    pub async fn confirm_pending_payments(&self, user_id: Uuid) -> BillingResult<ReconcileRun> {
        self.reconciler
            .check_user_pending_subscriptions(user_id)
            .await
    }

    /// Build the full service from environment configuration.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let payplus_config = PayPlusConfig::from_env()?;
        let currency = payplus_config.currency.clone();
        let gateway: Arc<dyn PaymentGateway> = Arc::new(PayPlusClient::new(payplus_config));
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool));
        Ok(Self::new(store, gateway, currency, ReconcileConfig::from_env()))
    }
}
