//! Payment gateway abstraction.
//!
//! The core treats the recurring-billing provider (PayPlus) as an external
//! HTTP API with defined request/response shapes. Everything network-bound
//! lives behind this trait so the orchestrator and reconciler can be tested
//! against scripted gateways.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;

/// Provider status code that marks a successful charge. Every other code is
/// treated as an opaque failure taxonomy pending provider documentation.
pub const STATUS_CODE_SUCCESS: &str = "000";

/// Request to charge a stored payment token.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub token: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

/// Outcome of a token charge.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeOutcome {
    pub success: bool,
    pub transaction_id: String,
    pub status_code: String,
    pub error: Option<String>,
}

/// Request to create a hosted payment page for a new subscription.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentPageRequest {
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub customer_reference: String,
    /// Recurring billing interval understood by the provider
    /// ("daily" / "monthly" / "yearly").
    pub recurring_interval: String,
}

/// A created hosted payment page.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentPage {
    pub page_request_uid: String,
    pub payment_url: String,
}

/// Transaction details inside a transaction-history entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayTransactionInfo {
    pub status_code: String,
    #[serde(default)]
    pub amount_by_currency: Option<Decimal>,
    #[serde(default)]
    pub transaction_at: Option<String>,
}

/// Reference back to the payment page a transaction was created from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentPageRef {
    pub uuid: String,
}

/// One entry of the provider's transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub uuid: String,
    pub information: GatewayTransactionInfo,
    #[serde(default)]
    pub payment_page_payment_request: Option<PaymentPageRef>,
    /// UID of the recurring subscription created by this transaction, when
    /// the payment page was opened in recurring mode.
    #[serde(default)]
    pub recurring_uid: Option<String>,
}

impl GatewayTransaction {
    pub fn is_success(&self) -> bool {
        self.information.status_code == STATUS_CODE_SUCCESS
    }
}

/// One entry of the provider's recurring-charge history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringCharge {
    pub charge_number: i64,
    pub transaction_uid: String,
    pub status: String,
    pub status_code: String,
    #[serde(default)]
    pub charged_at: Option<String>,
    pub amount: Decimal,
}

impl RecurringCharge {
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_CODE_SUCCESS
    }
}

/// External recurring-billing provider.
///
/// Calls are blocking I/O that can fail or time out independently of the
/// local database. A charge that times out client-side may still have
/// succeeded server-side; callers guard against double counting with the
/// renewal idempotency check on the external transaction UID.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge a stored payment token immediately.
    async fn charge_token(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome>;

    /// Update the billing amount of an existing recurring subscription.
    /// The provider applies the new amount from its own next cycle.
    async fn update_recurring_amount(
        &self,
        subscription_uid: &str,
        new_amount: Decimal,
        reason: &str,
    ) -> BillingResult<()>;

    /// Create a hosted payment page for a new recurring subscription.
    async fn create_payment_page(
        &self,
        request: PaymentPageRequest,
    ) -> BillingResult<PaymentPage>;

    /// Stop all future charges of a recurring subscription.
    async fn cancel_recurring(&self, subscription_uid: &str) -> BillingResult<()>;

    /// Query the provider's transaction history for transactions created
    /// from the given payment page request.
    async fn query_transaction_history(
        &self,
        page_request_uid: &str,
    ) -> BillingResult<Vec<GatewayTransaction>>;

    /// Query the charge history of a recurring subscription, most recent last.
    async fn query_recurring_charges(
        &self,
        subscription_uid: &str,
    ) -> BillingResult<Vec<RecurringCharge>>;
}
