//! Domain model for plans, subscriptions, transactions and history.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Billing period of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Daily => "daily",
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "daily" => BillingPeriod::Daily,
            "yearly" => BillingPeriod::Yearly,
            _ => BillingPeriod::Monthly,
        }
    }

    /// Next billing date after `from` for this period.
    ///
    /// Month/year arithmetic clamps the day to the target month's length
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        match self {
            BillingPeriod::Daily => from + Duration::days(1),
            BillingPeriod::Monthly => add_months(from, 1),
            BillingPeriod::Yearly => add_months(from, 12),
        }
    }
}

fn add_months(from: OffsetDateTime, months: i32) -> OffsetDateTime {
    let total = from.year() * 12 + from.month() as i32 - 1 + months;
    let year = total.div_euclid(12);
    let month = (total.rem_euclid(12) + 1) as u8;
    #[allow(clippy::unwrap_used)] // month is always 1..=12 here
    let month = time::Month::try_from(month).unwrap();
    let max_day = time::util::days_in_year_month(year, month);
    let day = from.day().min(max_day);
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => from.replace_date(date),
        // Unreachable: day is clamped to the month's length
        Err(_) => from + Duration::days(30 * months as i64),
    }
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "cancelled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Pending,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment status of a transaction.
///
/// Transitions follow a fixed table: `pending` may move to `completed`,
/// `failed` or `cancelled`; `failed` and `cancelled` may return to `pending`
/// (retry); `completed` may move to `refunded`; `refunded` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            "cancelled" => PaymentStatus::Cancelled,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, to),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
                | (Completed, Refunded)
        )
    }

    /// Validated transition. Invalid transitions fail and mutate nothing.
    pub fn transition(self, to: PaymentStatus) -> BillingResult<PaymentStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(BillingError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A purchasable subscription plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub billing_period: BillingPeriod,
    pub is_active: bool,
}

/// A pending (scheduled) downgrade stored in subscription metadata.
///
/// At most one may exist per subscription at a time. Created by downgrade
/// scheduling, consumed by cancellation or by the renewal reconciliation
/// that observes the effective date has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPlanChange {
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    pub new_recurring_amount: Decimal,
}

/// Record of the most recent applied plan change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanChangeRecord {
    Upgrade {
        from_plan_id: Uuid,
        to_plan_id: Uuid,
        prorated_amount: Decimal,
        #[serde(with = "time::serde::rfc3339")]
        changed_at: OffsetDateTime,
    },
    Downgrade {
        from_plan_id: Uuid,
        to_plan_id: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        effective_date: OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        changed_at: OffsetDateTime,
    },
}

/// Audit entry for a pending downgrade that was cancelled before taking effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledPlanChange {
    #[serde(flatten)]
    pub change: PendingPlanChange,
    #[serde(with = "time::serde::rfc3339")]
    pub cancelled_at: OffsetDateTime,
}

/// Typed view of the subscription `metadata` JSONB column.
///
/// Parsed at the store boundary so readers and writers cannot drift on the
/// embedded sub-schemas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_plan_change: Option<PendingPlanChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_plan_change: Option<PlanChangeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled_plan_changes: Vec<CancelledPlanChange>,
}

impl SubscriptionMetadata {
    pub fn from_value(value: &serde_json::Value) -> BillingResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| BillingError::Internal(format!("Malformed subscription metadata: {}", e)))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A user's subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub status: SubscriptionStatus,
    /// Price actually billed; snapshot of the plan price at subscription
    /// time. May differ from the plan's current price.
    pub billing_price: Decimal,
    pub original_price: Decimal,
    pub start_date: Option<OffsetDateTime>,
    pub next_billing_date: Option<OffsetDateTime>,
    /// External recurring-billing identifier. Immutable once set.
    pub payplus_subscription_uid: Option<String>,
    pub cancel_at_period_end: bool,
    pub cancellation_reason: Option<String>,
    pub metadata: SubscriptionMetadata,
    /// Persisted attempt counter for payment-page status polling.
    pub status_check_attempts: i32,
    /// Optimistic-concurrency version, bumped by every composite write.
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// True while the billing cycle has not yet ended.
    pub fn cycle_is_open(&self, now: OffsetDateTime) -> bool {
        self.next_billing_date.map(|d| d > now).unwrap_or(false)
    }
}

/// A payment transaction against the gateway.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Nullable: also used for one-off content purchases.
    pub subscription_id: Option<Uuid>,
    pub payment_method: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub payplus_transaction_uid: Option<String>,
    pub payment_page_request_uid: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub transaction_type: String,
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Transaction type markers.
pub mod transaction_type {
    pub const SUBSCRIPTION_INITIAL: &str = "subscription_initial";
    pub const SUBSCRIPTION_RENEWAL: &str = "subscription_renewal";
    pub const UPGRADE_PRORATION: &str = "upgrade_proration";
}

/// Lifecycle event recorded in the append-only subscription history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    Subscribed,
    Activated,
    Upgraded,
    DowngradeScheduled,
    DowngradeCancelled,
    Downgraded,
    Renewed,
    Cancelled,
    Expired,
}

impl HistoryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEvent::Subscribed => "subscribed",
            HistoryEvent::Activated => "activated",
            HistoryEvent::Upgraded => "upgraded",
            HistoryEvent::DowngradeScheduled => "downgrade_scheduled",
            HistoryEvent::DowngradeCancelled => "downgrade_cancelled",
            HistoryEvent::Downgraded => "downgraded",
            HistoryEvent::Renewed => "renewed",
            HistoryEvent::Cancelled => "cancelled",
            HistoryEvent::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "activated" => HistoryEvent::Activated,
            "upgraded" => HistoryEvent::Upgraded,
            "downgrade_scheduled" => HistoryEvent::DowngradeScheduled,
            "downgrade_cancelled" => HistoryEvent::DowngradeCancelled,
            "downgraded" => HistoryEvent::Downgraded,
            "renewed" => HistoryEvent::Renewed,
            "cancelled" => HistoryEvent::Cancelled,
            "expired" => HistoryEvent::Expired,
            _ => HistoryEvent::Subscribed,
        }
    }
}

/// One row of the append-only subscription audit log.
#[derive(Debug, Clone)]
pub struct SubscriptionHistoryRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub event: HistoryEvent,
    pub details: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// A stored payment method (tokenized card).
#[derive(Debug, Clone)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub card_last_four: Option<String>,
    pub is_default: bool,
}
