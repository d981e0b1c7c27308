//! In-memory mock implementations of the store and gateway seams.
#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeOutcome, ChargeRequest, GatewayTransaction, PaymentGateway, PaymentPage,
    PaymentPageRequest, RecurringCharge, STATUS_CODE_SUCCESS,
};
use crate::model::{
    HistoryEvent, PaymentMethod, PaymentStatus, PlanChangeRecord, Subscription,
    SubscriptionHistoryRecord, SubscriptionMetadata, SubscriptionPlan, SubscriptionStatus,
    Transaction, transaction_type,
};
use crate::store::{
    ActivateCommit, CancelCommit, DowngradeCommit, NewPendingSubscription, RenewalRecord,
    SubscriptionStore, UpgradeCommit,
};

// ============================================================================
// InMemoryStore
// ============================================================================

#[derive(Default)]
struct StoreState {
    subscriptions: HashMap<Uuid, Subscription>,
    plans: HashMap<Uuid, SubscriptionPlan>,
    transactions: Vec<Transaction>,
    history: Vec<SubscriptionHistoryRecord>,
    payment_methods: Vec<PaymentMethod>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: SubscriptionPlan) {
        self.state.lock().unwrap().plans.insert(plan.id, plan);
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub fn insert_payment_method(&self, method: PaymentMethod) {
        self.state.lock().unwrap().payment_methods.push(method);
    }

    pub fn insert_transaction(&self, transaction: Transaction) {
        self.state.lock().unwrap().transactions.push(transaction);
    }

    pub fn get_subscription(&self, id: Uuid) -> Option<Subscription> {
        self.state.lock().unwrap().subscriptions.get(&id).cloned()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().transactions.clone()
    }

    pub fn history_events(&self, subscription_id: Uuid) -> Vec<HistoryEvent> {
        self.state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id)
            .map(|h| h.event)
            .collect()
    }

    fn push_history(
        state: &mut StoreState,
        subscription_id: Uuid,
        user_id: Uuid,
        event: HistoryEvent,
        details: serde_json::Value,
    ) {
        state.history.push(SubscriptionHistoryRecord {
            id: Uuid::new_v4(),
            subscription_id,
            user_id,
            event,
            details,
            created_at: OffsetDateTime::now_utc(),
        });
    }

    fn locked_subscription(
        state: &mut StoreState,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription> {
        let sub = state
            .subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        if sub.version != expected_version {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process (version {} != {})",
                subscription_id, sub.version, expected_version
            )));
        }
        Ok(sub)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().unwrap().subscriptions.get(&id).cloned())
    }

    async fn subscription_for_user(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .get(&id)
            .filter(|s| s.user_id == user_id)
            .cloned())
    }

    async fn active_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn pending_subscriptions_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn plan(&self, id: Uuid) -> BillingResult<Option<SubscriptionPlan>> {
        Ok(self.state.lock().unwrap().plans.get(&id).cloned())
    }

    async fn active_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let state = self.state.lock().unwrap();
        let mut plans: Vec<SubscriptionPlan> =
            state.plans.values().filter(|p| p.is_active).cloned().collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price));
        Ok(plans)
    }

    async fn transaction_by_gateway_uid(&self, uid: &str) -> BillingResult<Option<Transaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .find(|t| t.payplus_transaction_uid.as_deref() == Some(uid))
            .cloned())
    }

    async fn initial_transaction(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Transaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .find(|t| {
                t.subscription_id == Some(subscription_id)
                    && t.transaction_type == transaction_type::SUBSCRIPTION_INITIAL
            })
            .cloned())
    }

    async fn payment_method_for_user(
        &self,
        user_id: Uuid,
        payment_method_id: Option<Uuid>,
    ) -> BillingResult<Option<PaymentMethod>> {
        let state = self.state.lock().unwrap();
        Ok(match payment_method_id {
            Some(id) => state
                .payment_methods
                .iter()
                .find(|m| m.id == id && m.user_id == user_id)
                .cloned(),
            None => state
                .payment_methods
                .iter()
                .find(|m| m.user_id == user_id && m.is_default)
                .cloned(),
        })
    }

    async fn history_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryRecord>> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<SubscriptionHistoryRecord> = state
            .history
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn subscriptions_with_matured_downgrades(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        let mut matured: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.metadata
                        .pending_plan_change
                        .as_ref()
                        .map(|p| p.effective_date <= now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        matured.truncate(limit as usize);
        Ok(matured)
    }

    async fn active_subscriptions_due_for_renewal(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.payplus_subscription_uid.is_some()
                    && s.next_billing_date.map(|d| d <= cutoff).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_date);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn users_with_pending_subscriptions(&self, limit: i64) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().unwrap();
        let mut users: Vec<Uuid> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Pending)
            .map(|s| s.user_id)
            .collect();
        users.sort();
        users.dedup();
        users.truncate(limit as usize);
        Ok(users)
    }

    async fn create_pending_subscription(
        &self,
        new: NewPendingSubscription,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            subscription_plan_id: new.plan_id,
            status: SubscriptionStatus::Pending,
            billing_price: new.billing_price,
            original_price: new.original_price,
            start_date: None,
            next_billing_date: None,
            payplus_subscription_uid: None,
            cancel_at_period_end: false,
            cancellation_reason: None,
            metadata: SubscriptionMetadata::default(),
            status_check_attempts: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        state.transactions.push(Transaction {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            subscription_id: Some(subscription.id),
            payment_method: None,
            amount: new.billing_price,
            currency: new.currency,
            payment_status: PaymentStatus::Pending,
            payplus_transaction_uid: None,
            payment_page_request_uid: Some(new.page_request_uid),
            provider_response: None,
            transaction_type: transaction_type::SUBSCRIPTION_INITIAL.to_string(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        });
        Self::push_history(
            &mut state,
            subscription.id,
            new.user_id,
            HistoryEvent::Subscribed,
            serde_json::json!({}),
        );
        state.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn commit_upgrade(&self, commit: UpgradeCommit) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub =
            Self::locked_subscription(&mut state, commit.subscription_id, commit.expected_version)?;

        sub.subscription_plan_id = commit.new_plan_id;
        sub.billing_price = commit.new_billing_price;
        sub.original_price = commit.new_billing_price;
        sub.metadata.last_plan_change = Some(commit.last_plan_change.clone());
        sub.metadata.pending_plan_change = None;
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();

        state.transactions.push(Transaction {
            id: Uuid::new_v4(),
            user_id: sub.user_id,
            subscription_id: Some(sub.id),
            payment_method: commit.charge.payment_method.clone(),
            amount: commit.charge.amount,
            currency: commit.charge.currency.clone(),
            payment_status: PaymentStatus::Completed,
            payplus_transaction_uid: Some(commit.charge.gateway_transaction_uid.clone()),
            payment_page_request_uid: None,
            provider_response: Some(commit.charge.provider_response.clone()),
            transaction_type: transaction_type::UPGRADE_PRORATION.to_string(),
            failure_reason: None,
            created_at: sub.updated_at,
            updated_at: sub.updated_at,
        });
        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::Upgraded,
            serde_json::to_value(&commit.last_plan_change).unwrap(),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn schedule_downgrade(&self, commit: DowngradeCommit) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub =
            Self::locked_subscription(&mut state, commit.subscription_id, commit.expected_version)?;

        if sub.metadata.pending_plan_change.is_some() {
            return Err(BillingError::Validation(
                "A plan change is already pending for this subscription".to_string(),
            ));
        }
        sub.metadata.pending_plan_change = Some(commit.pending.clone());
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();

        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::DowngradeScheduled,
            serde_json::to_value(&commit.pending).unwrap(),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn cancel_pending_downgrade(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub = Self::locked_subscription(&mut state, subscription_id, expected_version)?;

        let pending = sub.metadata.pending_plan_change.take().ok_or_else(|| {
            BillingError::Validation("No pending plan change to cancel".to_string())
        })?;
        sub.metadata
            .cancelled_plan_changes
            .push(crate::model::CancelledPlanChange {
                change: pending.clone(),
                cancelled_at: OffsetDateTime::now_utc(),
            });
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();

        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::DowngradeCancelled,
            serde_json::to_value(&pending).unwrap(),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn apply_pending_downgrade(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub = Self::locked_subscription(&mut state, subscription_id, expected_version)?;

        let pending = sub.metadata.pending_plan_change.take().ok_or_else(|| {
            BillingError::Validation("No pending plan change to apply".to_string())
        })?;
        sub.subscription_plan_id = pending.to_plan_id;
        sub.billing_price = pending.new_recurring_amount;
        sub.original_price = pending.new_recurring_amount;
        sub.metadata.last_plan_change = Some(PlanChangeRecord::Downgrade {
            from_plan_id: pending.from_plan_id,
            to_plan_id: pending.to_plan_id,
            effective_date: pending.effective_date,
            changed_at: OffsetDateTime::now_utc(),
        });
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();

        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::Downgraded,
            serde_json::to_value(&pending).unwrap(),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn activate(&self, commit: ActivateCommit) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub =
            Self::locked_subscription(&mut state, commit.subscription_id, commit.expected_version)?;

        if let (Some(existing), Some(incoming)) = (
            sub.payplus_subscription_uid.as_deref(),
            commit.payplus_subscription_uid.as_deref(),
        ) {
            if existing != incoming {
                return Err(BillingError::Validation(format!(
                    "Subscription {} already linked to recurring UID {}",
                    sub.id, existing
                )));
            }
        }

        sub.status = SubscriptionStatus::Active;
        sub.start_date = Some(commit.start_date);
        sub.next_billing_date = Some(commit.next_billing_date);
        if sub.payplus_subscription_uid.is_none() {
            sub.payplus_subscription_uid = commit.payplus_subscription_uid.clone();
        }
        sub.status_check_attempts = 0;
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();

        for t in state.transactions.iter_mut() {
            if t.subscription_id == Some(sub.id)
                && t.transaction_type == transaction_type::SUBSCRIPTION_INITIAL
                && t.payment_status == PaymentStatus::Pending
            {
                t.payment_status = PaymentStatus::Completed;
                if t.payplus_transaction_uid.is_none() {
                    t.payplus_transaction_uid = commit.gateway_transaction_uid.clone();
                }
            }
        }

        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::Activated,
            serde_json::json!({}),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn cancel(&self, commit: CancelCommit) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub =
            Self::locked_subscription(&mut state, commit.subscription_id, commit.expected_version)?;

        if commit.at_period_end {
            sub.cancel_at_period_end = true;
        } else {
            sub.status = SubscriptionStatus::Cancelled;
            for t in state.transactions.iter_mut() {
                if t.subscription_id == Some(sub.id)
                    && t.transaction_type == transaction_type::SUBSCRIPTION_INITIAL
                    && t.payment_status == PaymentStatus::Pending
                {
                    t.payment_status = PaymentStatus::Cancelled;
                    t.failure_reason = Some(commit.reason.clone());
                }
            }
        }
        sub.cancellation_reason = Some(commit.reason.clone());
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();

        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::Cancelled,
            serde_json::json!({ "reason": commit.reason }),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn record_renewal_transaction(
        &self,
        record: RenewalRecord,
    ) -> BillingResult<Option<Transaction>> {
        let mut state = self.state.lock().unwrap();
        if state
            .transactions
            .iter()
            .any(|t| t.payplus_transaction_uid.as_deref() == Some(&record.gateway_transaction_uid))
        {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            user_id: record.user_id,
            subscription_id: Some(record.subscription_id),
            payment_method: None,
            amount: record.amount,
            currency: record.currency,
            payment_status: if record.success {
                PaymentStatus::Completed
            } else {
                PaymentStatus::Failed
            },
            payplus_transaction_uid: Some(record.gateway_transaction_uid.clone()),
            payment_page_request_uid: None,
            provider_response: Some(record.provider_response),
            transaction_type: transaction_type::SUBSCRIPTION_RENEWAL.to_string(),
            failure_reason: if record.success {
                None
            } else {
                Some(format!("provider status code {}", record.status_code))
            },
            created_at: now,
            updated_at: now,
        };
        state.transactions.push(transaction.clone());
        Self::push_history(
            &mut state,
            record.subscription_id,
            record.user_id,
            HistoryEvent::Renewed,
            serde_json::json!({ "success": record.success }),
        );
        Ok(Some(transaction))
    }

    async fn mark_renewed(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub = Self::locked_subscription(&mut state, subscription_id, expected_version)?;
        sub.start_date = sub.next_billing_date;
        sub.next_billing_date = Some(next_billing_date);
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn expire(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        reason: String,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        let mut sub = Self::locked_subscription(&mut state, subscription_id, expected_version)?;
        sub.status = SubscriptionStatus::Expired;
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();
        Self::push_history(
            &mut state,
            sub.id,
            sub.user_id,
            HistoryEvent::Expired,
            serde_json::json!({ "reason": reason }),
        );
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn bump_status_check_attempts(&self, subscription_id: Uuid) -> BillingResult<i32> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        sub.status_check_attempts += 1;
        Ok(sub.status_check_attempts)
    }
}

// ============================================================================
// ScriptedGateway
// ============================================================================

/// Calls observed by the scripted gateway, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Charge(Decimal),
    UpdateRecurring(String, Decimal),
    CancelRecurring(String),
    CreatePage(Decimal),
    QueryHistory(String),
    QueryCharges(String),
}

#[derive(Default)]
struct GatewayScript {
    charge_results: VecDeque<BillingResult<ChargeOutcome>>,
    recurring_update_results: VecDeque<BillingResult<()>>,
    page_transactions: HashMap<String, Vec<GatewayTransaction>>,
    page_errors: HashMap<String, BillingError>,
    history_errors: VecDeque<BillingError>,
    recurring_charges: HashMap<String, Vec<RecurringCharge>>,
    calls: Vec<GatewayCall>,
}

/// Gateway double with scriptable responses. Unscripted calls succeed with
/// generated identifiers and empty histories.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<GatewayScript>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_charge_result(&self, result: BillingResult<ChargeOutcome>) {
        self.script.lock().unwrap().charge_results.push_back(result);
    }

    pub fn push_declined_charge(&self, status_code: &str) {
        self.push_charge_result(Ok(ChargeOutcome {
            success: false,
            transaction_id: format!("txn-{}", Uuid::new_v4()),
            status_code: status_code.to_string(),
            error: Some("card declined".to_string()),
        }));
    }

    pub fn push_recurring_update_result(&self, result: BillingResult<()>) {
        self.script
            .lock()
            .unwrap()
            .recurring_update_results
            .push_back(result);
    }

    pub fn set_page_transactions(&self, page_uid: &str, transactions: Vec<GatewayTransaction>) {
        self.script
            .lock()
            .unwrap()
            .page_transactions
            .insert(page_uid.to_string(), transactions);
    }

    pub fn push_history_error(&self, error: BillingError) {
        self.script.lock().unwrap().history_errors.push_back(error);
    }

    /// Fail the next history query for one specific page.
    pub fn set_page_error(&self, page_uid: &str, error: BillingError) {
        self.script
            .lock()
            .unwrap()
            .page_errors
            .insert(page_uid.to_string(), error);
    }

    pub fn set_recurring_charges(&self, recurring_uid: &str, charges: Vec<RecurringCharge>) {
        self.script
            .lock()
            .unwrap()
            .recurring_charges
            .insert(recurring_uid.to_string(), charges);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.script.lock().unwrap().calls.clone()
    }

    /// A successful page transaction carrying a recurring UID.
    pub fn successful_page_transaction(page_uid: &str, recurring_uid: &str) -> GatewayTransaction {
        GatewayTransaction {
            uuid: format!("txn-{}", Uuid::new_v4()),
            information: crate::gateway::GatewayTransactionInfo {
                status_code: STATUS_CODE_SUCCESS.to_string(),
                amount_by_currency: None,
                transaction_at: None,
            },
            payment_page_payment_request: Some(crate::gateway::PaymentPageRef {
                uuid: page_uid.to_string(),
            }),
            recurring_uid: Some(recurring_uid.to_string()),
        }
    }

    /// A failed page transaction with the given provider status code.
    pub fn failed_page_transaction(page_uid: &str, status_code: &str) -> GatewayTransaction {
        GatewayTransaction {
            uuid: format!("txn-{}", Uuid::new_v4()),
            information: crate::gateway::GatewayTransactionInfo {
                status_code: status_code.to_string(),
                amount_by_currency: None,
                transaction_at: None,
            },
            payment_page_payment_request: Some(crate::gateway::PaymentPageRef {
                uuid: page_uid.to_string(),
            }),
            recurring_uid: None,
        }
    }

    pub fn recurring_charge(uid: &str, status_code: &str, amount: Decimal) -> RecurringCharge {
        RecurringCharge {
            charge_number: 1,
            transaction_uid: uid.to_string(),
            status: if status_code == STATUS_CODE_SUCCESS {
                "approved".to_string()
            } else {
                "declined".to_string()
            },
            status_code: status_code.to_string(),
            charged_at: None,
            amount,
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge_token(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(GatewayCall::Charge(request.amount));
        match script.charge_results.pop_front() {
            Some(result) => result,
            None => Ok(ChargeOutcome {
                success: true,
                transaction_id: format!("txn-{}", Uuid::new_v4()),
                status_code: STATUS_CODE_SUCCESS.to_string(),
                error: None,
            }),
        }
    }

    async fn update_recurring_amount(
        &self,
        subscription_uid: &str,
        new_amount: Decimal,
        _reason: &str,
    ) -> BillingResult<()> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(GatewayCall::UpdateRecurring(
            subscription_uid.to_string(),
            new_amount,
        ));
        script.recurring_update_results.pop_front().unwrap_or(Ok(()))
    }

    async fn create_payment_page(
        &self,
        request: PaymentPageRequest,
    ) -> BillingResult<PaymentPage> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(GatewayCall::CreatePage(request.amount));
        let uid = format!("page-{}", Uuid::new_v4());
        Ok(PaymentPage {
            payment_url: format!("https://payments.example/{}", uid),
            page_request_uid: uid,
        })
    }

    async fn cancel_recurring(&self, subscription_uid: &str) -> BillingResult<()> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(GatewayCall::CancelRecurring(subscription_uid.to_string()));
        Ok(())
    }

    async fn query_transaction_history(
        &self,
        page_request_uid: &str,
    ) -> BillingResult<Vec<GatewayTransaction>> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(GatewayCall::QueryHistory(page_request_uid.to_string()));
        if let Some(error) = script.page_errors.remove(page_request_uid) {
            return Err(error);
        }
        if let Some(error) = script.history_errors.pop_front() {
            return Err(error);
        }
        Ok(script
            .page_transactions
            .get(page_request_uid)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_recurring_charges(
        &self,
        subscription_uid: &str,
    ) -> BillingResult<Vec<RecurringCharge>> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(GatewayCall::QueryCharges(subscription_uid.to_string()));
        Ok(script
            .recurring_charges
            .get(subscription_uid)
            .cloned()
            .unwrap_or_default())
    }
}
