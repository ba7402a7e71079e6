//! # Payment Processor Boundary
//!
//! Everything the core needs from the outside money world, behind one
//! trait: create a hosted checkout session, refund a charge. The
//! processor is treated as an unreliable executor, never as a source of
//! truth — every reaction to it is idempotent on our side.
//!
//! [`StripeProcessor`] is the production implementation. [`MockProcessor`]
//! records calls and fails on request, which is how the partial-success
//! withdrawal semantics get exercised in tests and dev mode.

pub mod mock;
pub mod stripe;
pub mod webhook;

use async_trait::async_trait;
use uuid::Uuid;

pub use mock::MockProcessor;
pub use stripe::StripeProcessor;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures from the external payment processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The processor rejected the request (declined refund, disputed
    /// charge, invalid reference). Not retriable.
    #[error("processor declined: {detail}")]
    Declined {
        /// The processor's stated reason, safe to log.
        detail: String,
    },

    /// The call did not complete within the 10-second budget.
    #[error("processor call timed out")]
    Timeout,

    /// Transport-level failure (connection refused, TLS, DNS).
    #[error("processor transport error: {detail}")]
    Transport {
        /// The underlying transport failure.
        detail: String,
    },

    /// The processor answered with something we could not parse.
    #[error("malformed processor response: {detail}")]
    Malformed {
        /// What was wrong with the payload.
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Everything needed to open a hosted checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// The purchasing user; round-trips through the session as the
    /// client reference so the webhook can attribute the payment.
    pub user_id: Uuid,
    /// Tokens being purchased (recorded in session metadata).
    pub tokens: u64,
    /// Charge amount in processor minor units (cents).
    pub amount_cents: u64,
    /// ISO-4217 currency code, lowercase for the processor.
    pub currency: String,
    /// Where the processor sends the buyer after payment.
    pub success_url: String,
    /// Where the processor sends the buyer on cancel.
    pub cancel_url: String,
}

/// A created checkout session: the URL the client is redirected to and
/// the processor's session identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    /// Processor session id (`cs_...` for Stripe).
    pub session_id: String,
    /// Hosted checkout URL for the buyer.
    pub checkout_url: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Capability set of the external payment processor.
///
/// Implementations own their transport and timeout handling; callers own
/// idempotency. Both methods may be invoked while the caller holds a
/// wallet lock — that is deliberate, the refund result decides whether a
/// lot is decremented.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Opens a hosted checkout session for a token purchase.
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ProcessorError>;

    /// Refunds `amount_cents` of the charge identified by `payment_ref`.
    ///
    /// Returns the processor's refund identifier.
    async fn refund_payment(
        &self,
        payment_ref: &str,
        amount_cents: u64,
    ) -> Result<String, ProcessorError>;
}
