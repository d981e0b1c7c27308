//! Error types for the subscription core.

use rust_decimal::Decimal;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the subscription core.
///
/// Business-rule failures (`Validation`, `NotEligible`, `InvalidTransition`)
/// are expected outcomes and never leave partial state behind. `Consistency`
/// is the one fatal variant: an external charge went through but the gateway's
/// recurring amount could not be updated, so the charge stands while the local
/// transaction rolled back. It must be resolved by manual review, never by a
/// silent retry.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not eligible: {0}")]
    NotEligible(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment declined: {0}")]
    ChargeDeclined(String),

    #[error("Payment method required")]
    PaymentMethodRequired,

    #[error(
        "CONSISTENCY: charge of {charged_amount} succeeded for subscription {subscription_uid} \
         but recurring amount update failed: {cause}"
    )]
    Consistency {
        subscription_uid: String,
        charged_amount: Decimal,
        gateway_transaction_id: String,
        cause: String,
    },

    #[error("Invalid payment status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// User-visible message, distinct from the internal taxonomy.
    pub fn user_message(&self) -> String {
        match self {
            BillingError::Validation(msg) | BillingError::NotEligible(msg) => msg.clone(),
            BillingError::ChargeDeclined(_) => {
                "Your payment could not be processed. Please check your payment method and try again.".to_string()
            }
            BillingError::PaymentMethodRequired => {
                "A saved payment method is required for this operation.".to_string()
            }
            BillingError::Gateway(_) => {
                "The payment provider is temporarily unavailable. Please try again shortly.".to_string()
            }
            BillingError::Consistency { .. } => {
                "Your payment was received but the subscription update needs attention. Our team has been notified.".to_string()
            }
            BillingError::ConcurrentModification(_) => {
                "This subscription was just modified. Please refresh and try again.".to_string()
            }
            BillingError::SubscriptionNotFound(_) | BillingError::NotFound(_) => {
                "The requested subscription could not be found.".to_string()
            }
            _ => "Something went wrong. Please try again later.".to_string(),
        }
    }

    /// True for expected business-rule failures that mutate nothing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BillingError::Validation(_)
                | BillingError::NotEligible(_)
                | BillingError::ChargeDeclined(_)
                | BillingError::PaymentMethodRequired
                | BillingError::InvalidTransition { .. }
                | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}
