//! Environment-driven configuration for the subscription core.

use crate::error::{BillingError, BillingResult};

/// Default number of status-check attempts before a pending payment page is
/// considered abandoned.
pub const DEFAULT_MAX_STATUS_ATTEMPTS: u32 = 6;

/// Default cap on pending subscriptions examined per batch call.
pub const DEFAULT_BATCH_LIMIT: i64 = 10;

/// Reconciliation policy consumed by `PaymentStatusReconciler`.
///
/// `polling_enabled` is the operational kill switch: when false, every
/// reconciliation entry point returns a neutral `Disabled` result without
/// contacting the gateway.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub max_status_attempts: u32,
    pub batch_limit: i64,
    pub polling_enabled: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_status_attempts: DEFAULT_MAX_STATUS_ATTEMPTS,
            batch_limit: DEFAULT_BATCH_LIMIT,
            polling_enabled: true,
        }
    }
}

impl ReconcileConfig {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// - `RECONCILE_MAX_ATTEMPTS` (default 6)
    /// - `RECONCILE_BATCH_LIMIT` (default 10)
    /// - `RECONCILE_POLLING_ENABLED` (default true)
    pub fn from_env() -> Self {
        let max_status_attempts = std::env::var("RECONCILE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_STATUS_ATTEMPTS);

        let batch_limit = std::env::var("RECONCILE_BATCH_LIMIT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_BATCH_LIMIT);

        let polling_enabled = std::env::var("RECONCILE_POLLING_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        Self {
            max_status_attempts,
            batch_limit,
            polling_enabled,
        }
    }
}

/// PayPlus gateway credentials and endpoints.
#[derive(Debug, Clone)]
pub struct PayPlusConfig {
    pub api_key: String,
    pub secret_key: String,
    /// Base URL of the PayPlus REST API (override for the sandbox).
    pub api_base: String,
    /// UID of the payment page template used for new subscriptions.
    pub payment_page_uid: String,
    pub currency: String,
}

impl PayPlusConfig {
    pub fn from_env() -> BillingResult<Self> {
        let api_key = std::env::var("PAYPLUS_API_KEY")
            .map_err(|_| BillingError::Config("PAYPLUS_API_KEY not set".to_string()))?;
        let secret_key = std::env::var("PAYPLUS_SECRET_KEY")
            .map_err(|_| BillingError::Config("PAYPLUS_SECRET_KEY not set".to_string()))?;
        let payment_page_uid = std::env::var("PAYPLUS_PAYMENT_PAGE_UID")
            .map_err(|_| BillingError::Config("PAYPLUS_PAYMENT_PAGE_UID not set".to_string()))?;

        let api_base = std::env::var("PAYPLUS_API_BASE")
            .unwrap_or_else(|_| "https://restapi.payplus.co.il/api/v1.0".to_string());
        let currency = std::env::var("PAYPLUS_CURRENCY").unwrap_or_else(|_| "ILS".to_string());

        Ok(Self {
            api_key,
            secret_key,
            api_base,
            payment_page_uid,
            currency,
        })
    }
}
