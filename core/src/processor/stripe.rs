//! # Stripe Client
//!
//! reqwest-backed [`PaymentProcessor`] implementation against the Stripe
//! REST API. Two endpoints, form-encoded, bearer-authenticated:
//!
//! - `POST /v1/checkout/sessions` — hosted checkout for token purchases.
//! - `POST /v1/refunds` — partial refunds against a payment intent.
//!
//! Every call carries the 10-second budget from
//! [`PROCESSOR_CALL_TIMEOUT`]; a timeout surfaces as
//! [`ProcessorError::Timeout`] and the caller decides what that means
//! (for withdrawals: skip the lot, keep going).

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::PROCESSOR_CALL_TIMEOUT;
use crate::processor::{CheckoutRequest, CheckoutSession, PaymentProcessor, ProcessorError};

/// Default Stripe API base.
const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Stripe-backed payment processor.
#[derive(Debug, Clone)]
pub struct StripeProcessor {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl StripeProcessor {
    /// Creates a client authenticated with the given secret key.
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, STRIPE_API_BASE)
    }

    /// Creates a client against a non-default API base. Test hook.
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROCESSOR_CALL_TIMEOUT)
            .build()
            .expect("http client construction");
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, ProcessorError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProcessorError::Timeout
                } else {
                    ProcessorError::Transport {
                        detail: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| ProcessorError::Transport {
            detail: e.to_string(),
        })?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<ApiErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(ProcessorError::Declined { detail });
        }

        serde_json::from_slice(&body).map_err(|e| ProcessorError::Malformed {
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        let form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url),
            ("cancel_url".to_string(), request.cancel_url),
            (
                "client_reference_id".to_string(),
                request.user_id.to_string(),
            ),
            ("metadata[tokens]".to_string(), request.tokens.to_string()),
            (
                "line_items[0][price_data][currency]".to_string(),
                request.currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                request.amount_cents.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                format!("{} Chally tokens", request.tokens),
            ),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];

        let session: SessionResponse = self.post_form("/v1/checkout/sessions", &form).await?;

        tracing::info!(
            session_id = %session.id,
            user_id = %request.user_id,
            tokens = request.tokens,
            "checkout session created"
        );

        Ok(CheckoutSession {
            session_id: session.id,
            checkout_url: session.url,
        })
    }

    async fn refund_payment(
        &self,
        payment_ref: &str,
        amount_cents: u64,
    ) -> Result<String, ProcessorError> {
        let form = vec![
            ("payment_intent".to_string(), payment_ref.to_string()),
            ("amount".to_string(), amount_cents.to_string()),
        ];

        let refund: RefundResponse = self.post_form("/v1/refunds", &form).await?;

        if refund.status.as_deref() == Some("failed") {
            return Err(ProcessorError::Declined {
                detail: format!("refund {} reported failed", refund.id),
            });
        }

        tracing::info!(
            refund_id = %refund.id,
            payment_ref,
            amount_cents,
            "refund executed"
        );

        Ok(refund.id)
    }
}
