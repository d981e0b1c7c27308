//! Postgres implementation of `SubscriptionStore`.
//!
//! Every composite write is one database transaction: lock the subscription
//! row (`FOR UPDATE`), verify the caller's observed version, mutate, append
//! the history record, commit. A version mismatch rolls the whole operation
//! back with `ConcurrentModification`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction as PgTx};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{
    HistoryEvent, PaymentMethod, PaymentStatus, PlanChangeRecord, Subscription,
    SubscriptionHistoryRecord, SubscriptionMetadata, SubscriptionPlan, SubscriptionStatus,
    Transaction, transaction_type,
};
use crate::store::{
    ActivateCommit, CancelCommit, DowngradeCommit, NewPendingSubscription, RenewalRecord,
    SubscriptionStore, UpgradeCommit,
};

pub struct PgSubscriptionStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    subscription_plan_id: Uuid,
    status: String,
    billing_price: Decimal,
    original_price: Decimal,
    start_date: Option<OffsetDateTime>,
    next_billing_date: Option<OffsetDateTime>,
    payplus_subscription_uid: Option<String>,
    cancel_at_period_end: bool,
    cancellation_reason: Option<String>,
    metadata: serde_json::Value,
    status_check_attempts: i32,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, subscription_plan_id, status, billing_price, \
     original_price, start_date, next_billing_date, payplus_subscription_uid, \
     cancel_at_period_end, cancellation_reason, metadata, status_check_attempts, \
     version, created_at, updated_at";

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            subscription_plan_id: row.subscription_plan_id,
            status: SubscriptionStatus::from_string(&row.status),
            billing_price: row.billing_price,
            original_price: row.original_price,
            start_date: row.start_date,
            next_billing_date: row.next_billing_date,
            payplus_subscription_uid: row.payplus_subscription_uid,
            cancel_at_period_end: row.cancel_at_period_end,
            cancellation_reason: row.cancellation_reason,
            metadata: SubscriptionMetadata::from_value(&row.metadata)?,
            status_check_attempts: row.status_check_attempts,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price: Decimal,
    billing_period: String,
    is_active: bool,
}

impl From<PlanRow> for SubscriptionPlan {
    fn from(row: PlanRow) -> Self {
        SubscriptionPlan {
            id: row.id,
            name: row.name,
            price: row.price,
            billing_period: crate::model::BillingPeriod::from_string(&row.billing_period),
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    payment_method: Option<String>,
    amount: Decimal,
    currency: String,
    payment_status: String,
    payplus_transaction_uid: Option<String>,
    payment_page_request_uid: Option<String>,
    provider_response: Option<serde_json::Value>,
    transaction_type: String,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

const TRANSACTION_COLUMNS: &str = "id, user_id, subscription_id, payment_method, amount, \
     currency, payment_status, payplus_transaction_uid, payment_page_request_uid, \
     provider_response, transaction_type, failure_reason, created_at, updated_at";

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Transaction {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            payment_method: row.payment_method,
            amount: row.amount,
            currency: row.currency,
            payment_status: PaymentStatus::from_string(&row.payment_status),
            payplus_transaction_uid: row.payplus_transaction_uid,
            payment_page_request_uid: row.payment_page_request_uid,
            provider_response: row.provider_response,
            transaction_type: row.transaction_type,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    subscription_id: Uuid,
    user_id: Uuid,
    event: String,
    details: serde_json::Value,
    created_at: OffsetDateTime,
}

impl From<HistoryRow> for SubscriptionHistoryRecord {
    fn from(row: HistoryRow) -> Self {
        SubscriptionHistoryRecord {
            id: row.id,
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            event: HistoryEvent::from_string(&row.event),
            details: row.details,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentMethodRow {
    id: Uuid,
    user_id: Uuid,
    token: String,
    card_last_four: Option<String>,
    is_default: bool,
}

impl From<PaymentMethodRow> for PaymentMethod {
    fn from(row: PaymentMethodRow) -> Self {
        PaymentMethod {
            id: row.id,
            user_id: row.user_id,
            token: row.token,
            card_last_four: row.card_last_four,
            is_default: row.is_default,
        }
    }
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> BillingResult<PgTx<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }

    /// Lock the subscription row and verify the caller's observed version.
    async fn lock_and_check(
        tx: &mut PgTx<'_, Postgres>,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(subscription_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let row = row.ok_or_else(|| {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        })?;

        if row.version != expected_version {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process (version {} != {})",
                subscription_id, row.version, expected_version
            )));
        }

        Subscription::try_from(row)
    }

    /// Persist subscription mutations and bump the version. Callers already
    /// hold the row lock, so zero affected rows is an internal error here.
    #[allow(clippy::too_many_arguments)]
    async fn update_subscription(
        tx: &mut PgTx<'_, Postgres>,
        subscription_id: Uuid,
        expected_version: i64,
        status: Option<SubscriptionStatus>,
        plan_id: Option<Uuid>,
        billing_price: Option<Decimal>,
        original_price: Option<Decimal>,
        metadata: Option<&SubscriptionMetadata>,
    ) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = COALESCE($1, status),
                subscription_plan_id = COALESCE($2, subscription_plan_id),
                billing_price = COALESCE($3, billing_price),
                original_price = COALESCE($4, original_price),
                metadata = COALESCE($5, metadata),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(plan_id)
        .bind(billing_price)
        .bind(original_price)
        .bind(metadata.map(|m| m.to_value()))
        .bind(subscription_id)
        .bind(expected_version)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process. Please retry.",
                subscription_id
            )));
        }
        Ok(())
    }

    async fn insert_history(
        tx: &mut PgTx<'_, Postgres>,
        subscription_id: Uuid,
        user_id: Uuid,
        event: HistoryEvent,
        details: serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history (id, subscription_id, user_id, event, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(user_id)
        .bind(event.as_str())
        .bind(details)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    async fn fetch_subscription(
        tx: &mut PgTx<'_, Postgres>,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: SubscriptionRow = sqlx::query_as(&query)
            .bind(subscription_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Subscription::try_from(row)
    }

    async fn commit_tx(tx: PgTx<'_, Postgres>) -> BillingResult<()> {
        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn subscription_for_user(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE id = $1 AND user_id = $2",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn active_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status = 'active' \
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn pending_subscriptions_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status = 'pending' \
             ORDER BY created_at ASC LIMIT $2",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn plan(&self, id: Uuid) -> BillingResult<Option<SubscriptionPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, price, billing_period, is_active FROM subscription_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionPlan::from))
    }

    async fn active_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            "SELECT id, name, price, billing_period, is_active FROM subscription_plans \
             WHERE is_active = true ORDER BY price ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionPlan::from).collect())
    }

    async fn transaction_by_gateway_uid(&self, uid: &str) -> BillingResult<Option<Transaction>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE payplus_transaction_uid = $1",
            TRANSACTION_COLUMNS
        );
        let row: Option<TransactionRow> = sqlx::query_as(&query)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Transaction::from))
    }

    async fn initial_transaction(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Transaction>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE subscription_id = $1 \
             AND transaction_type = 'subscription_initial' \
             ORDER BY created_at ASC LIMIT 1",
            TRANSACTION_COLUMNS
        );
        let row: Option<TransactionRow> = sqlx::query_as(&query)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Transaction::from))
    }

    async fn payment_method_for_user(
        &self,
        user_id: Uuid,
        payment_method_id: Option<Uuid>,
    ) -> BillingResult<Option<PaymentMethod>> {
        let row: Option<PaymentMethodRow> = match payment_method_id {
            Some(id) => {
                sqlx::query_as(
                    "SELECT id, user_id, token, card_last_four, is_default \
                     FROM payment_methods WHERE id = $1 AND user_id = $2",
                )
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, user_id, token, card_last_four, is_default \
                     FROM payment_methods WHERE user_id = $1 AND is_default = true \
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.map(PaymentMethod::from))
    }

    async fn history_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryRecord>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, subscription_id, user_id, event, details, created_at \
             FROM subscription_history WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionHistoryRecord::from).collect())
    }

    async fn subscriptions_with_matured_downgrades(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE status = 'active' \
             AND metadata ? 'pending_plan_change' \
             AND (metadata -> 'pending_plan_change' ->> 'effective_date')::timestamptz <= $1 \
             ORDER BY updated_at ASC LIMIT $2",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn active_subscriptions_due_for_renewal(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE status = 'active' \
             AND payplus_subscription_uid IS NOT NULL \
             AND next_billing_date IS NOT NULL AND next_billing_date <= $1 \
             ORDER BY next_billing_date ASC LIMIT $2",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn users_with_pending_subscriptions(&self, limit: i64) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT user_id FROM subscriptions WHERE status = 'pending' LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn create_pending_subscription(
        &self,
        new: NewPendingSubscription,
    ) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let subscription_id = Uuid::new_v4();
        let query = format!(
            "INSERT INTO subscriptions \
                 (id, user_id, subscription_plan_id, status, billing_price, original_price, metadata) \
             VALUES ($1, $2, $3, 'pending', $4, $5, '{{}}'::jsonb) \
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row: SubscriptionRow = sqlx::query_as(&query)
            .bind(subscription_id)
            .bind(new.user_id)
            .bind(new.plan_id)
            .bind(new.billing_price)
            .bind(new.original_price)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, user_id, subscription_id, amount, currency, payment_status,
                 payment_page_request_uid, transaction_type)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(subscription_id)
        .bind(new.billing_price)
        .bind(&new.currency)
        .bind(&new.page_request_uid)
        .bind(transaction_type::SUBSCRIPTION_INITIAL)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Self::insert_history(
            &mut tx,
            subscription_id,
            new.user_id,
            HistoryEvent::Subscribed,
            serde_json::json!({
                "plan_id": new.plan_id,
                "billing_price": new.billing_price,
                "page_request_uid": new.page_request_uid,
            }),
        )
        .await?;

        Self::commit_tx(tx).await?;
        Subscription::try_from(row)
    }

    async fn commit_upgrade(&self, commit: UpgradeCommit) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current =
            Self::lock_and_check(&mut tx, commit.subscription_id, commit.expected_version).await?;

        let mut metadata = current.metadata.clone();
        metadata.last_plan_change = Some(commit.last_plan_change.clone());
        metadata.pending_plan_change = None;

        Self::update_subscription(
            &mut tx,
            commit.subscription_id,
            commit.expected_version,
            None,
            Some(commit.new_plan_id),
            Some(commit.new_billing_price),
            Some(commit.new_billing_price),
            Some(&metadata),
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, user_id, subscription_id, payment_method, amount, currency,
                 payment_status, payplus_transaction_uid, provider_response, transaction_type)
            VALUES ($1, $2, $3, $4, $5, $6, 'completed', $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(current.user_id)
        .bind(commit.subscription_id)
        .bind(&commit.charge.payment_method)
        .bind(commit.charge.amount)
        .bind(&commit.charge.currency)
        .bind(&commit.charge.gateway_transaction_uid)
        .bind(&commit.charge.provider_response)
        .bind(transaction_type::UPGRADE_PRORATION)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let details = serde_json::to_value(&commit.last_plan_change)
            .unwrap_or(serde_json::Value::Null);
        Self::insert_history(
            &mut tx,
            commit.subscription_id,
            current.user_id,
            HistoryEvent::Upgraded,
            details,
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, commit.subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn schedule_downgrade(&self, commit: DowngradeCommit) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current =
            Self::lock_and_check(&mut tx, commit.subscription_id, commit.expected_version).await?;

        if current.metadata.pending_plan_change.is_some() {
            return Err(BillingError::Validation(
                "A plan change is already pending for this subscription".to_string(),
            ));
        }

        let mut metadata = current.metadata.clone();
        metadata.pending_plan_change = Some(commit.pending.clone());

        Self::update_subscription(
            &mut tx,
            commit.subscription_id,
            commit.expected_version,
            None,
            None,
            None,
            None,
            Some(&metadata),
        )
        .await?;

        Self::insert_history(
            &mut tx,
            commit.subscription_id,
            current.user_id,
            HistoryEvent::DowngradeScheduled,
            serde_json::to_value(&commit.pending).unwrap_or(serde_json::Value::Null),
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, commit.subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn cancel_pending_downgrade(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current = Self::lock_and_check(&mut tx, subscription_id, expected_version).await?;

        let pending = current.metadata.pending_plan_change.clone().ok_or_else(|| {
            BillingError::Validation("No pending plan change to cancel".to_string())
        })?;

        let mut metadata = current.metadata.clone();
        metadata.pending_plan_change = None;
        metadata.cancelled_plan_changes.push(crate::model::CancelledPlanChange {
            change: pending.clone(),
            cancelled_at: OffsetDateTime::now_utc(),
        });

        Self::update_subscription(
            &mut tx,
            subscription_id,
            expected_version,
            None,
            None,
            None,
            None,
            Some(&metadata),
        )
        .await?;

        Self::insert_history(
            &mut tx,
            subscription_id,
            current.user_id,
            HistoryEvent::DowngradeCancelled,
            serde_json::to_value(&pending).unwrap_or(serde_json::Value::Null),
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn apply_pending_downgrade(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current = Self::lock_and_check(&mut tx, subscription_id, expected_version).await?;

        let pending = current.metadata.pending_plan_change.clone().ok_or_else(|| {
            BillingError::Validation("No pending plan change to apply".to_string())
        })?;

        let mut metadata = current.metadata.clone();
        metadata.pending_plan_change = None;
        metadata.last_plan_change = Some(PlanChangeRecord::Downgrade {
            from_plan_id: pending.from_plan_id,
            to_plan_id: pending.to_plan_id,
            effective_date: pending.effective_date,
            changed_at: OffsetDateTime::now_utc(),
        });

        Self::update_subscription(
            &mut tx,
            subscription_id,
            expected_version,
            None,
            Some(pending.to_plan_id),
            Some(pending.new_recurring_amount),
            Some(pending.new_recurring_amount),
            Some(&metadata),
        )
        .await?;

        Self::insert_history(
            &mut tx,
            subscription_id,
            current.user_id,
            HistoryEvent::Downgraded,
            serde_json::to_value(&pending).unwrap_or(serde_json::Value::Null),
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn activate(&self, commit: ActivateCommit) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current =
            Self::lock_and_check(&mut tx, commit.subscription_id, commit.expected_version).await?;

        // The external recurring UID is immutable once set
        if let (Some(existing), Some(incoming)) = (
            current.payplus_subscription_uid.as_deref(),
            commit.payplus_subscription_uid.as_deref(),
        ) {
            if existing != incoming {
                return Err(BillingError::Validation(format!(
                    "Subscription {} already linked to recurring UID {}",
                    commit.subscription_id, existing
                )));
            }
        }

        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'active',
                start_date = $1,
                next_billing_date = $2,
                payplus_subscription_uid = COALESCE(payplus_subscription_uid, $3),
                status_check_attempts = 0,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $4 AND version = $5
            "#,
        )
        .bind(commit.start_date)
        .bind(commit.next_billing_date)
        .bind(&commit.payplus_subscription_uid)
        .bind(commit.subscription_id)
        .bind(commit.expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process. Please retry.",
                commit.subscription_id
            )));
        }

        // Complete the initial transaction with the provider's data
        sqlx::query(
            r#"
            UPDATE transactions SET
                payment_status = 'completed',
                payplus_transaction_uid = COALESCE($1, payplus_transaction_uid),
                provider_response = COALESCE($2, provider_response),
                updated_at = NOW()
            WHERE subscription_id = $3
              AND transaction_type = 'subscription_initial'
              AND payment_status = 'pending'
            "#,
        )
        .bind(&commit.gateway_transaction_uid)
        .bind(&commit.provider_response)
        .bind(commit.subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Self::insert_history(
            &mut tx,
            commit.subscription_id,
            current.user_id,
            HistoryEvent::Activated,
            serde_json::json!({
                "payplus_subscription_uid": commit.payplus_subscription_uid,
                "gateway_transaction_uid": commit.gateway_transaction_uid,
                "next_billing_date": commit.next_billing_date.to_string(),
            }),
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, commit.subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn cancel(&self, commit: CancelCommit) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current =
            Self::lock_and_check(&mut tx, commit.subscription_id, commit.expected_version).await?;

        if commit.at_period_end {
            sqlx::query(
                r#"
                UPDATE subscriptions SET
                    cancel_at_period_end = true,
                    cancellation_reason = $1,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $2 AND version = $3
                "#,
            )
            .bind(&commit.reason)
            .bind(commit.subscription_id)
            .bind(commit.expected_version)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        } else {
            sqlx::query(
                r#"
                UPDATE subscriptions SET
                    status = 'cancelled',
                    cancellation_reason = $1,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $2 AND version = $3
                "#,
            )
            .bind(&commit.reason)
            .bind(commit.subscription_id)
            .bind(commit.expected_version)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            // A still-pending initial transaction will never complete
            sqlx::query(
                r#"
                UPDATE transactions SET
                    payment_status = 'cancelled',
                    failure_reason = $1,
                    updated_at = NOW()
                WHERE subscription_id = $2
                  AND transaction_type = 'subscription_initial'
                  AND payment_status = 'pending'
                "#,
            )
            .bind(&commit.reason)
            .bind(commit.subscription_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        Self::insert_history(
            &mut tx,
            commit.subscription_id,
            current.user_id,
            HistoryEvent::Cancelled,
            serde_json::json!({
                "reason": commit.reason,
                "at_period_end": commit.at_period_end,
            }),
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, commit.subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn record_renewal_transaction(
        &self,
        record: RenewalRecord,
    ) -> BillingResult<Option<Transaction>> {
        let mut tx = self.begin().await?;

        // Idempotency guard: re-observing a recorded external UID is a no-op
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM transactions WHERE payplus_transaction_uid = $1 FOR UPDATE",
        )
        .bind(&record.gateway_transaction_uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        if existing.is_some() {
            return Ok(None);
        }

        let status = if record.success { "completed" } else { "failed" };
        let failure_reason = if record.success {
            None
        } else {
            Some(format!("provider status code {}", record.status_code))
        };

        let query = format!(
            "INSERT INTO transactions \
                 (id, user_id, subscription_id, amount, currency, payment_status, \
                  payplus_transaction_uid, provider_response, transaction_type, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {}",
            TRANSACTION_COLUMNS
        );
        let row: TransactionRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(record.user_id)
            .bind(record.subscription_id)
            .bind(record.amount)
            .bind(&record.currency)
            .bind(status)
            .bind(&record.gateway_transaction_uid)
            .bind(&record.provider_response)
            .bind(transaction_type::SUBSCRIPTION_RENEWAL)
            .bind(failure_reason)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Self::insert_history(
            &mut tx,
            record.subscription_id,
            record.user_id,
            HistoryEvent::Renewed,
            serde_json::json!({
                "gateway_transaction_uid": record.gateway_transaction_uid,
                "amount": record.amount,
                "success": record.success,
                "status_code": record.status_code,
            }),
        )
        .await?;

        Self::commit_tx(tx).await?;
        Ok(Some(Transaction::from(row)))
    }

    async fn mark_renewed(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current = Self::lock_and_check(&mut tx, subscription_id, expected_version).await?;
        let start = current.next_billing_date.unwrap_or_else(OffsetDateTime::now_utc);

        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                start_date = $1,
                next_billing_date = $2,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(start)
        .bind(next_billing_date)
        .bind(subscription_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process. Please retry.",
                subscription_id
            )));
        }

        let updated = Self::fetch_subscription(&mut tx, subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn expire(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        reason: String,
    ) -> BillingResult<Subscription> {
        let mut tx = self.begin().await?;

        let current = Self::lock_and_check(&mut tx, subscription_id, expected_version).await?;

        Self::update_subscription(
            &mut tx,
            subscription_id,
            expected_version,
            Some(SubscriptionStatus::Expired),
            None,
            None,
            None,
            None,
        )
        .await?;

        Self::insert_history(
            &mut tx,
            subscription_id,
            current.user_id,
            HistoryEvent::Expired,
            serde_json::json!({ "reason": reason }),
        )
        .await?;

        let updated = Self::fetch_subscription(&mut tx, subscription_id).await?;
        Self::commit_tx(tx).await?;
        Ok(updated)
    }

    async fn bump_status_check_attempts(&self, subscription_id: Uuid) -> BillingResult<i32> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE subscriptions SET status_check_attempts = status_check_attempts + 1, \
             updated_at = NOW() WHERE id = $1 RETURNING status_check_attempts",
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts)
    }
}
