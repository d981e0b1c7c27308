// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::Consistency carries gateway context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClassMarket Billing Module
//!
//! Subscription lifecycle core for the content marketplace, built around the
//! PayPlus recurring-payments gateway.
//!
//! ## Features
//!
//! - **Subscription Lifecycle**: Hosted payment pages, activation, cancellation
//! - **Plan Changes**: Prorated mid-cycle upgrades, end-of-cycle downgrades
//! - **Payment Reconciliation**: Polling-based status resolution (no webhooks)
//! - **Renewals**: Recurring-charge observation and cycle advancement
//! - **Audit Trail**: Append-only subscription history for every transition
//! - **Invariants**: Runnable consistency checks over the billing tables

pub mod config;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod lifecycle;
pub mod model;
pub mod payplus;
pub mod plan_change;
pub mod postgres;
pub mod proration;
pub mod reconcile;
pub mod store;

#[cfg(test)]
pub(crate) mod mocks;

// Config
pub use config::{PayPlusConfig, ReconcileConfig};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    ChargeOutcome, ChargeRequest, GatewayTransaction, PaymentGateway, PaymentPage,
    PaymentPageRequest, RecurringCharge, STATUS_CODE_SUCCESS,
};

// PayPlus client
pub use payplus::PayPlusClient;

// Model
pub use model::{
    BillingPeriod, HistoryEvent, PaymentMethod, PaymentStatus, PendingPlanChange, PlanChangeRecord,
    Subscription, SubscriptionHistoryRecord, SubscriptionMetadata, SubscriptionPlan,
    SubscriptionStatus, Transaction,
};

// Proration
pub use proration::{
    calculate_downgrade_scheduling, calculate_upgrade_proration, validate_plan_change, ChangeType,
    DowngradeScheduling, PlanChangeReport, UpgradeProration,
};

// Store
pub use postgres::PgSubscriptionStore;
pub use store::{
    ActivateCommit, CancelCommit, ChargeRecord, DowngradeCommit, NewPendingSubscription,
    RenewalRecord, SubscriptionStore, UpgradeCommit,
};

// Plan changes
pub use plan_change::{
    AvailablePlanChanges, DowngradeOutcome, PlanChangeOption, PlanChangeOrchestrator,
    UpgradeOutcome,
};

// Reconciliation
pub use reconcile::{
    PageStatus, PaymentStatusReconciler, ReconcileOutcome, ReconcileRun, ReconcileSummary,
    RenewalOutcome, RenewalSweepSummary,
};

// Lifecycle
pub use lifecycle::{
    BillingService, PaymentRequest, SubscriptionLifecycleService, SubscriptionView,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};
