//! Persistence seam for the subscription core.
//!
//! Reads are plain lookups. Writes are composite transactional operations:
//! each one runs atomically in the backing store, takes the caller's
//! observed `version` of the subscription row, fails with
//! `ConcurrentModification` when the row has moved, and appends the matching
//! history record as its final step. This is how two concurrent plan-change
//! requests, or a plan change racing a reconciliation poll, are prevented
//! from both succeeding against the same subscription.

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::{
    PaymentMethod, PendingPlanChange, PlanChangeRecord, Subscription, SubscriptionHistoryRecord,
    SubscriptionPlan, Transaction,
};

/// Parameters for creating a `pending` subscription plus its initial
/// pending transaction when a payment page is requested.
#[derive(Debug, Clone)]
pub struct NewPendingSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub billing_price: Decimal,
    pub original_price: Decimal,
    pub currency: String,
    pub page_request_uid: String,
}

/// The external charge backing an upgrade commit.
#[derive(Debug, Clone)]
pub struct ChargeRecord {
    pub gateway_transaction_uid: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: Option<String>,
    pub provider_response: serde_json::Value,
}

/// Atomic persistence of a completed upgrade (step 7-9 of the upgrade flow).
#[derive(Debug, Clone)]
pub struct UpgradeCommit {
    pub subscription_id: Uuid,
    pub expected_version: i64,
    pub new_plan_id: Uuid,
    pub new_billing_price: Decimal,
    pub charge: ChargeRecord,
    pub last_plan_change: PlanChangeRecord,
}

/// Atomic scheduling of a pending downgrade.
#[derive(Debug, Clone)]
pub struct DowngradeCommit {
    pub subscription_id: Uuid,
    pub expected_version: i64,
    pub pending: PendingPlanChange,
}

/// Atomic activation of a pending subscription after a confirmed charge.
#[derive(Debug, Clone)]
pub struct ActivateCommit {
    pub subscription_id: Uuid,
    pub expected_version: i64,
    /// Set on first activation; the store refuses to overwrite an existing
    /// value (the external UID is immutable for the life of the subscription).
    pub payplus_subscription_uid: Option<String>,
    pub gateway_transaction_uid: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub start_date: OffsetDateTime,
    pub next_billing_date: OffsetDateTime,
}

/// Atomic cancellation.
#[derive(Debug, Clone)]
pub struct CancelCommit {
    pub subscription_id: Uuid,
    pub expected_version: i64,
    pub reason: String,
    /// When true the subscription stays active until `next_billing_date`.
    pub at_period_end: bool,
}

/// Idempotent record of a renewal charge observed at the gateway.
#[derive(Debug, Clone)]
pub struct RenewalRecord {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub gateway_transaction_uid: String,
    pub amount: Decimal,
    pub currency: String,
    pub success: bool,
    pub status_code: String,
    pub provider_response: serde_json::Value,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // ---- reads -----------------------------------------------------------

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Subscription scoped to its owner; `None` when it exists but belongs
    /// to another user.
    async fn subscription_for_user(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn active_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn pending_subscriptions_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    async fn plan(&self, id: Uuid) -> BillingResult<Option<SubscriptionPlan>>;

    async fn active_plans(&self) -> BillingResult<Vec<SubscriptionPlan>>;

    async fn transaction_by_gateway_uid(&self, uid: &str) -> BillingResult<Option<Transaction>>;

    /// The initial (payment page) transaction of a subscription, if any.
    async fn initial_transaction(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Transaction>>;

    /// Resolve a payment method: explicit id (ownership-checked) or the
    /// user's default.
    async fn payment_method_for_user(
        &self,
        user_id: Uuid,
        payment_method_id: Option<Uuid>,
    ) -> BillingResult<Option<PaymentMethod>>;

    async fn history_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryRecord>>;

    /// Active subscriptions whose pending downgrade's effective date has
    /// passed (worker sweep).
    async fn subscriptions_with_matured_downgrades(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions whose next billing date passed at least
    /// `overdue` ago (renewal-detection sweep).
    async fn active_subscriptions_due_for_renewal(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Distinct users that currently have pending subscriptions.
    async fn users_with_pending_subscriptions(&self, limit: i64) -> BillingResult<Vec<Uuid>>;

    // ---- composite transactional writes ----------------------------------

    async fn create_pending_subscription(
        &self,
        new: NewPendingSubscription,
    ) -> BillingResult<Subscription>;

    async fn commit_upgrade(&self, commit: UpgradeCommit) -> BillingResult<Subscription>;

    async fn schedule_downgrade(&self, commit: DowngradeCommit) -> BillingResult<Subscription>;

    async fn cancel_pending_downgrade(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription>;

    /// Apply a matured pending downgrade: switch plan id and billing price,
    /// clear the pending change, record it as the last plan change.
    async fn apply_pending_downgrade(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription>;

    async fn activate(&self, commit: ActivateCommit) -> BillingResult<Subscription>;

    async fn cancel(&self, commit: CancelCommit) -> BillingResult<Subscription>;

    /// Record a renewal charge observed at the gateway. Returns `None` when
    /// a transaction with this external UID already exists (idempotent
    /// no-op confirmation, not an error).
    async fn record_renewal_transaction(
        &self,
        record: RenewalRecord,
    ) -> BillingResult<Option<Transaction>>;

    /// Advance the billing cycle after a confirmed renewal.
    async fn mark_renewed(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<Subscription>;

    /// Mark an active subscription expired (renewal failed for good).
    async fn expire(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        reason: String,
    ) -> BillingResult<Subscription>;

    /// Bump and return the persisted status-check attempt counter.
    async fn bump_status_check_attempts(&self, subscription_id: Uuid) -> BillingResult<i32>;
}
