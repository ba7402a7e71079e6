//! # Deposit Pipeline
//!
//! Two entry points that collaborate asynchronously through the payment
//! processor:
//!
//! 1. [`DepositPipeline::begin_deposit`] — the user asks to buy tokens.
//!    We validate the amount against the daily cap and open a hosted
//!    checkout session. **No ledger writes happen here** — until the
//!    processor confirms payment, nothing has happened to money.
//! 2. [`DepositPipeline::on_payment_confirmed`] — the processor's webhook
//!    reports a completed, paid session. We convert cents back to tokens
//!    and credit the wallet, with the payment intent as both idempotency
//!    key and refund reference.
//!
//! The processor retries webhooks until it sees a 2xx. Duplicate
//! deliveries collapse in the wallet credit (unique `(kind, external_id)`),
//! so unbounded retries are safe.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::config::{Settings, MAX_OPERATION_TOKENS};
use crate::error::{CoreError, CoreResult};
use crate::ledger::EntryKind;
use crate::processor::webhook::{WebhookEvent, CHECKOUT_COMPLETED, PAYMENT_STATUS_PAID};
use crate::processor::{CheckoutRequest, CheckoutSession, PaymentProcessor};
use crate::wallet::{CreditKind, Wallet};

/// What a webhook delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositOutcome {
    /// A wallet was credited (or the event was a replay of a credit that
    /// already happened — indistinguishable by design).
    Credited {
        /// The credited user.
        user_id: Uuid,
        /// Tokens credited.
        tokens: u64,
        /// The deposit ledger entry.
        entry_id: Uuid,
    },
    /// The event was acknowledged but is not a paid checkout completion.
    Ignored {
        /// The event type that was skipped.
        event_type: String,
    },
}

/// Checkout-session creation and webhook ingestion.
#[derive(Clone)]
pub struct DepositPipeline {
    wallet: Wallet,
    processor: Arc<dyn PaymentProcessor>,
    settings: Arc<Settings>,
}

impl DepositPipeline {
    /// Creates the pipeline over the shared wallet and processor.
    pub fn new(wallet: Wallet, processor: Arc<dyn PaymentProcessor>, settings: Arc<Settings>) -> Self {
        Self {
            wallet,
            processor,
            settings,
        }
    }

    /// Opens a checkout session for a token purchase.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidAmount`] — zero, over the per-operation cap,
    ///   or a cents conversion that would overflow.
    /// - [`CoreError::DailyLimit`] — the purchase would push the user past
    ///   the per-day deposit ceiling (measured from UTC midnight).
    /// - [`CoreError::Processor`] — the processor refused the session.
    pub async fn begin_deposit(
        &self,
        user_id: Uuid,
        tokens: u64,
        success_url: &str,
        cancel_url: &str,
    ) -> CoreResult<CheckoutSession> {
        if tokens == 0 {
            return Err(CoreError::invalid_amount("deposit amount must be positive"));
        }
        if tokens > MAX_OPERATION_TOKENS {
            return Err(CoreError::invalid_amount(format!(
                "deposit of {tokens} tokens exceeds the per-operation cap"
            )));
        }

        let used = self.wallet.ledger().sum_since(
            &user_id,
            EntryKind::Deposit,
            utc_midnight(Utc::now()),
        )?;
        let cap = self.settings.daily_deposit_cap_tokens;
        if tokens > cap.saturating_sub(used) {
            return Err(CoreError::DailyLimit {
                cap,
                used,
                requested: tokens,
            });
        }

        let amount_cents = tokens
            .checked_mul(self.settings.token_price_cents)
            .ok_or_else(|| CoreError::invalid_amount("token amount overflows cents"))?;

        let session = self
            .processor
            .create_checkout_session(CheckoutRequest {
                user_id,
                tokens,
                amount_cents,
                currency: self.settings.currency.clone(),
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            tokens,
            amount_cents,
            session_id = %session.session_id,
            "deposit checkout session opened"
        );

        Ok(session)
    }

    /// Applies a verified webhook event.
    ///
    /// Only `checkout.session.completed` events with `payment_status =
    /// paid` credit a wallet; everything else is acknowledged and
    /// skipped. A replayed event returns the original entry id and
    /// writes nothing.
    ///
    /// Any error from here must surface as a non-2xx response so the
    /// processor retries the delivery.
    pub async fn on_payment_confirmed(&self, event: &WebhookEvent) -> CoreResult<DepositOutcome> {
        if event.event_type != CHECKOUT_COMPLETED {
            return Ok(DepositOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        }
        if event.payment_status.as_deref() != Some(PAYMENT_STATUS_PAID) {
            tracing::info!(
                payment_status = event.payment_status.as_deref().unwrap_or("-"),
                "checkout completed without payment, skipping"
            );
            return Ok(DepositOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        }

        let payment_intent = event
            .payment_intent
            .as_deref()
            .ok_or_else(|| CoreError::invalid_amount("completed session without payment intent"))?;
        let user_id = event
            .client_reference_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| CoreError::invalid_amount("session reference is not a user id"))?;
        let amount_cents = event
            .amount_total
            .ok_or_else(|| CoreError::invalid_amount("completed session without amount"))?;

        let price = self.settings.token_price_cents;
        if amount_cents == 0 || amount_cents % price != 0 {
            return Err(CoreError::invalid_amount(format!(
                "charged amount {amount_cents} is not a whole number of tokens"
            )));
        }
        let tokens = amount_cents / price;

        let entry_id = self
            .wallet
            .credit(
                user_id,
                tokens,
                CreditKind::Deposit,
                Some(payment_intent),
                Some(payment_intent),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            tokens,
            payment_intent,
            "deposit credited"
        );

        Ok(DepositOutcome::Credited {
            user_id,
            tokens,
            entry_id,
        })
    }
}

/// Start of the current UTC day.
fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
