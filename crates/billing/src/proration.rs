//! Proration math for mid-cycle plan changes.
//!
//! Pure functions: no I/O, deterministic given inputs. Upgrades charge the
//! price difference prorated over the remaining billing cycle; downgrades
//! never prorate and take effect exactly at the next billing date.

use rust_decimal::{Decimal, RoundingStrategy};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::model::{Subscription, SubscriptionPlan, SubscriptionStatus};

/// Seconds per day, used for whole-day reporting.
const DAY_SECONDS: i64 = 86_400;

/// Direction of a plan change, inferred from price comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
}

/// Prorated charge for a mid-cycle upgrade.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UpgradeProration {
    /// Amount to charge now, rounded to 2 decimal places.
    pub prorated_amount: Decimal,
    pub remaining_days: i64,
    pub total_days: i64,
    /// Fraction of the billing cycle still ahead, in (0, 1].
    pub remaining_ratio: Decimal,
}

/// Scheduling data for an end-of-cycle downgrade.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DowngradeScheduling {
    /// Always equals the subscription's `next_billing_date`.
    pub effective_date: OffsetDateTime,
    pub days_remaining: i64,
    pub price_savings: Decimal,
}

/// Aggregated eligibility report for a plan change.
///
/// Collects every precondition failure instead of stopping at the first, so
/// a caller can surface all problems at once.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanChangeReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub change_type: Option<ChangeType>,
}

/// `i64::div_ceil` is unstable on stable Rust; this matches its behavior
/// for the positive divisor used here.
fn div_ceil(value: i64, divisor: i64) -> i64 {
    let quotient = value / divisor;
    if value % divisor > 0 {
        quotient + 1
    } else {
        quotient
    }
}

fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn cycle_bounds(
    subscription: &Subscription,
    now: OffsetDateTime,
) -> BillingResult<(OffsetDateTime, OffsetDateTime)> {
    let start = subscription
        .start_date
        .ok_or_else(|| BillingError::Validation("Subscription has no start date".to_string()))?;
    let next = subscription.next_billing_date.ok_or_else(|| {
        BillingError::Validation("Subscription has no next billing date".to_string())
    })?;
    if next <= now {
        return Err(BillingError::Validation(
            "Billing cycle has ended; plan changes require an open cycle".to_string(),
        ));
    }
    if next <= start {
        return Err(BillingError::Validation(
            "Billing cycle dates are inconsistent".to_string(),
        ));
    }
    Ok((start, next))
}

/// Compute the prorated charge for upgrading `subscription` to `new_plan`.
///
/// `remaining_ratio = (next_billing_date - now) / (next_billing_date - start_date)`,
/// `prorated_amount = round2((new_price - billing_price) * remaining_ratio)`.
pub fn calculate_upgrade_proration(
    subscription: &Subscription,
    current_plan: &SubscriptionPlan,
    new_plan: &SubscriptionPlan,
    now: OffsetDateTime,
) -> BillingResult<UpgradeProration> {
    if subscription.status != SubscriptionStatus::Active {
        return Err(BillingError::Validation(
            "Only active subscriptions can be upgraded".to_string(),
        ));
    }
    if current_plan.billing_period != new_plan.billing_period {
        return Err(BillingError::Validation(format!(
            "Billing period mismatch: {} vs {}",
            current_plan.billing_period.as_str(),
            new_plan.billing_period.as_str()
        )));
    }
    if new_plan.price <= subscription.billing_price {
        return Err(BillingError::Validation(
            "New plan price must be higher than the current billing price for an upgrade"
                .to_string(),
        ));
    }

    let (start, next) = cycle_bounds(subscription, now)?;

    let total_seconds = (next - start).whole_seconds();
    let remaining_seconds = (next - now).whole_seconds().min(total_seconds);

    let remaining_ratio = Decimal::from(remaining_seconds) / Decimal::from(total_seconds);
    let price_diff = new_plan.price - subscription.billing_price;
    let prorated_amount = round2(price_diff * remaining_ratio);

    Ok(UpgradeProration {
        prorated_amount,
        remaining_days: div_ceil(remaining_seconds, DAY_SECONDS),
        total_days: div_ceil(total_seconds, DAY_SECONDS),
        remaining_ratio,
    })
}

/// Compute the scheduling data for downgrading `subscription` to `new_plan`.
///
/// Downgrades never prorate mid-cycle: the effective date is exactly the
/// next billing date and nothing is charged now.
pub fn calculate_downgrade_scheduling(
    subscription: &Subscription,
    current_plan: &SubscriptionPlan,
    new_plan: &SubscriptionPlan,
    now: OffsetDateTime,
) -> BillingResult<DowngradeScheduling> {
    if subscription.status != SubscriptionStatus::Active {
        return Err(BillingError::Validation(
            "Only active subscriptions can be downgraded".to_string(),
        ));
    }
    if current_plan.billing_period != new_plan.billing_period {
        return Err(BillingError::Validation(format!(
            "Billing period mismatch: {} vs {}",
            current_plan.billing_period.as_str(),
            new_plan.billing_period.as_str()
        )));
    }
    let price_savings = subscription.billing_price - new_plan.price;
    if price_savings <= Decimal::ZERO {
        return Err(BillingError::Validation(
            "New plan price must be lower than the current billing price for a downgrade"
                .to_string(),
        ));
    }

    let (_, next) = cycle_bounds(subscription, now)?;
    let remaining_seconds = (next - now).whole_seconds();

    Ok(DowngradeScheduling {
        effective_date: next,
        days_remaining: div_ceil(remaining_seconds, DAY_SECONDS),
        price_savings,
    })
}

/// Aggregate all plan-change preconditions into a single report.
pub fn validate_plan_change(
    subscription: &Subscription,
    current_plan: &SubscriptionPlan,
    new_plan: &SubscriptionPlan,
    now: OffsetDateTime,
) -> PlanChangeReport {
    let mut errors = Vec::new();

    if subscription.status != SubscriptionStatus::Active {
        errors.push(format!(
            "Subscription is {}, expected active",
            subscription.status
        ));
    }
    if new_plan.id == subscription.subscription_plan_id {
        errors.push("Already subscribed to this plan".to_string());
    }
    if !new_plan.is_active {
        errors.push("Target plan is no longer available".to_string());
    }
    if current_plan.billing_period != new_plan.billing_period {
        errors.push(format!(
            "Billing period mismatch: {} vs {}",
            current_plan.billing_period.as_str(),
            new_plan.billing_period.as_str()
        ));
    }
    if subscription.metadata.pending_plan_change.is_some() {
        errors.push("A plan change is already pending for this subscription".to_string());
    }
    if subscription.payplus_subscription_uid.is_none() {
        errors.push("Subscription is not linked to the payment provider yet".to_string());
    }
    match subscription.next_billing_date {
        None => errors.push("Subscription has no next billing date".to_string()),
        Some(next) if next <= now => {
            errors.push("Billing cycle has ended; plan changes require an open cycle".to_string())
        }
        Some(_) => {}
    }

    let change_type = if new_plan.price > subscription.billing_price {
        Some(ChangeType::Upgrade)
    } else if new_plan.price < subscription.billing_price {
        Some(ChangeType::Downgrade)
    } else {
        errors.push("Target plan costs the same as the current plan".to_string());
        None
    };

    PlanChangeReport {
        valid: errors.is_empty(),
        errors,
        change_type,
    }
}
