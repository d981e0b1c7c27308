//! PayPlus REST API client.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::config::PayPlusConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeOutcome, ChargeRequest, GatewayTransaction, PaymentGateway, PaymentPage,
    PaymentPageRequest, RecurringCharge, STATUS_CODE_SUCCESS,
};

/// HTTP client for the PayPlus REST API.
#[derive(Clone)]
pub struct PayPlusClient {
    config: PayPlusConfig,
    http: reqwest::Client,
}

/// Standard PayPlus response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    results: EnvelopeResults,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeResults {
    status: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentPageData {
    page_request_uid: String,
    payment_page_link: String,
}

#[derive(Debug, Deserialize)]
struct ChargeData {
    transaction_uid: String,
    status_code: String,
    #[serde(default)]
    status_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionListData {
    #[serde(default)]
    transactions: Vec<GatewayTransaction>,
}

#[derive(Debug, Deserialize)]
struct RecurringChargesData {
    #[serde(default)]
    charges: Vec<RecurringCharge>,
}

impl PayPlusClient {
    pub fn new(config: PayPlusConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(PayPlusConfig::from_env()?))
    }

    pub fn config(&self) -> &PayPlusConfig {
        &self.config
    }

    /// POST a JSON body and decode the PayPlus envelope.
    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BillingResult<T> {
        let url = format!("{}{}", self.config.api_base, path);

        let response = self
            .http
            .post(&url)
            .header("api-key", &self.config.api_key)
            .header("secret-key", &self.config.secret_key)
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Request to {} failed: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                path = %path,
                status = %status,
                error_body = %error_body,
                "PayPlus API returned non-success status"
            );
            return Err(BillingError::Gateway(format!(
                "PayPlus API error ({}): {}",
                status, error_body
            )));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Failed to parse PayPlus response: {}", e)))?;

        if envelope.results.status != "success" {
            return Err(BillingError::Gateway(format!(
                "PayPlus rejected request to {}: {}",
                path,
                envelope.results.description.unwrap_or_default()
            )));
        }

        envelope
            .data
            .ok_or_else(|| BillingError::Gateway("PayPlus response missing data".to_string()))
    }
}

#[async_trait]
impl PaymentGateway for PayPlusClient {
    async fn charge_token(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome> {
        let body = serde_json::json!({
            "terminal_uid": self.config.payment_page_uid,
            "token": request.token,
            "amount": request.amount,
            "currency_code": request.currency,
            "more_info": request.description,
            "metadata": request.metadata,
        });

        let data: ChargeData = self.post("/Transactions/ChargeByToken", &body).await?;

        let success = data.status_code == STATUS_CODE_SUCCESS;
        if !success {
            tracing::warn!(
                transaction_uid = %data.transaction_uid,
                status_code = %data.status_code,
                "Token charge declined by PayPlus"
            );
        }

        Ok(ChargeOutcome {
            success,
            transaction_id: data.transaction_uid,
            status_code: data.status_code,
            error: data.status_description,
        })
    }

    async fn update_recurring_amount(
        &self,
        subscription_uid: &str,
        new_amount: Decimal,
        reason: &str,
    ) -> BillingResult<()> {
        let body = serde_json::json!({
            "recurring_uid": subscription_uid,
            "amount": new_amount,
            "more_info": reason,
        });

        let _: serde_json::Value = self.post("/RecurringPayments/Update", &body).await?;

        tracing::info!(
            subscription_uid = %subscription_uid,
            new_amount = %new_amount,
            "Updated recurring amount at PayPlus"
        );
        Ok(())
    }

    async fn create_payment_page(
        &self,
        request: PaymentPageRequest,
    ) -> BillingResult<PaymentPage> {
        let body = serde_json::json!({
            "payment_page_uid": self.config.payment_page_uid,
            "amount": request.amount,
            "currency_code": request.currency,
            "more_info": request.description,
            "customer_reference": request.customer_reference,
            "charge_method": "recurring",
            "recurring_interval": request.recurring_interval,
        });

        let data: PaymentPageData = self.post("/PaymentPages/generateLink", &body).await?;

        Ok(PaymentPage {
            page_request_uid: data.page_request_uid,
            payment_url: data.payment_page_link,
        })
    }

    async fn cancel_recurring(&self, subscription_uid: &str) -> BillingResult<()> {
        let body = serde_json::json!({
            "recurring_uid": subscription_uid,
        });

        let _: serde_json::Value = self.post("/RecurringPayments/Remove", &body).await?;

        tracing::info!(
            subscription_uid = %subscription_uid,
            "Cancelled recurring subscription at PayPlus"
        );
        Ok(())
    }

    async fn query_transaction_history(
        &self,
        page_request_uid: &str,
    ) -> BillingResult<Vec<GatewayTransaction>> {
        let body = serde_json::json!({
            "payment_page_request_uid": page_request_uid,
        });

        let data: TransactionListData = self.post("/Transactions/View", &body).await?;
        Ok(data.transactions)
    }

    async fn query_recurring_charges(
        &self,
        subscription_uid: &str,
    ) -> BillingResult<Vec<RecurringCharge>> {
        let body = serde_json::json!({
            "recurring_uid": subscription_uid,
        });

        let data: RecurringChargesData = self.post("/RecurringPayments/Charges", &body).await?;
        Ok(data.charges)
    }
}
