//! # Mock Payment Processor
//!
//! In-memory [`PaymentProcessor`] for tests and `--dev` mode. Records
//! every call, mints predictable identifiers, and can be told to fail
//! refunds for specific payment references — which is how the withdrawal
//! engine's skip-and-continue behavior gets exercised without a network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::processor::{CheckoutRequest, CheckoutSession, PaymentProcessor, ProcessorError};

/// A recorded refund call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRefund {
    /// The charge that was refunded against.
    pub payment_ref: String,
    /// Refunded amount in cents.
    pub amount_cents: u64,
    /// The refund id the mock returned.
    pub refund_id: String,
}

/// Scriptable in-memory processor.
#[derive(Debug, Default)]
pub struct MockProcessor {
    counter: AtomicU64,
    sessions: Mutex<Vec<CheckoutRequest>>,
    refunds: Mutex<Vec<RecordedRefund>>,
    failing_refs: Mutex<HashSet<String>>,
}

impl MockProcessor {
    /// Creates a mock that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every refund against `payment_ref` fail with `Declined`.
    pub fn fail_refunds_for(&self, payment_ref: &str) {
        self.failing_refs.lock().insert(payment_ref.to_string());
    }

    /// All checkout sessions requested so far.
    pub fn sessions(&self) -> Vec<CheckoutRequest> {
        self.sessions.lock().clone()
    }

    /// All refunds executed so far (failed attempts are not recorded).
    pub fn refunds(&self) -> Vec<RecordedRefund> {
        self.refunds.lock().clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}_{n:06}")
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        let session_id = self.next_id("cs_test");
        let checkout_url = format!("https://checkout.test/pay/{session_id}");
        self.sessions.lock().push(request);
        Ok(CheckoutSession {
            session_id,
            checkout_url,
        })
    }

    async fn refund_payment(
        &self,
        payment_ref: &str,
        amount_cents: u64,
    ) -> Result<String, ProcessorError> {
        if self.failing_refs.lock().contains(payment_ref) {
            return Err(ProcessorError::Declined {
                detail: format!("charge {payment_ref} is disputed"),
            });
        }

        let refund_id = self.next_id("re_test");
        self.refunds.lock().push(RecordedRefund {
            payment_ref: payment_ref.to_string(),
            amount_cents,
            refund_id: refund_id.clone(),
        });
        Ok(refund_id)
    }
}
