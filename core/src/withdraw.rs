//! # Withdrawal Engine
//!
//! Turns wallet tokens back into card refunds, oldest deposit first.
//!
//! The engine walks the user's refundable lots (FIFO, inside the refund
//! window) and asks the processor to refund each originating charge. A
//! processor failure on one lot does not abort the operation — the lot is
//! skipped untouched and the walk continues. This is partial success, not
//! a bug: the report says exactly what left the system, and the single
//! WITHDRAWAL ledger entry covers only that amount, so the balance
//! invariant survives any combination of refund outcomes.
//!
//! The user's wallet lock is held across the processor calls. That is
//! deliberate: whether a lot's `remaining` may be decremented is only
//! known after the processor answers, and no other mutation of this
//! wallet may interleave with the decision.
//!
//! All storage writes happen after the processor loop. An operation that
//! fails before then leaves no rows behind.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Settings, WithdrawMode};
use crate::error::{CoreError, CoreResult};
use crate::ledger::EntryKind;
use crate::processor::PaymentProcessor;
use crate::storage::CoreDb;
use crate::wallet::Wallet;

// ---------------------------------------------------------------------------
// Refund Record
// ---------------------------------------------------------------------------

/// Audit record of one executed external refund.
///
/// Created-and-final, like ledger entries. Binds the allocation that was
/// drained, the processor's refund id, and the WITHDRAWAL ledger entry
/// the amount was accounted under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    /// Unique refund record id.
    pub id: Uuid,
    /// The withdrawing user.
    pub user_id: Uuid,
    /// The lot this refund drained from.
    pub allocation_id: Uuid,
    /// Refunded amount in tokens.
    pub amount: u64,
    /// The processor's refund identifier.
    pub external_refund_id: String,
    /// The WITHDRAWAL ledger entry covering this refund.
    pub withdrawal_entry_id: Uuid,
    /// When the refund executed (UTC).
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// The outcome of a withdrawal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalReport {
    /// Tokens the user asked to withdraw.
    pub requested: u64,
    /// Tokens actually refunded out.
    pub refunded: u64,
    /// Ids of the [`Refund`] records created by this call.
    pub refund_ids: Vec<Uuid>,
    /// `true` when `refunded < requested` — some lots were skipped
    /// (processor failure) or refundable capacity ran out.
    pub partial: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// FIFO refund allocation against the external payment processor.
#[derive(Clone)]
pub struct WithdrawalEngine {
    db: Arc<CoreDb>,
    wallet: Wallet,
    processor: Arc<dyn PaymentProcessor>,
    settings: Arc<Settings>,
}

impl WithdrawalEngine {
    /// Creates the engine over the shared store, wallet, and processor.
    pub fn new(
        db: Arc<CoreDb>,
        wallet: Wallet,
        processor: Arc<dyn PaymentProcessor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            wallet,
            processor,
            settings,
        }
    }

    /// Withdraws up to `tokens` as external refunds, oldest deposit first.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidAmount`] — zero amount.
    /// - [`CoreError::Disabled`] — withdrawals switched off.
    /// - [`CoreError::Insufficient`] — balance below the requested amount.
    /// - [`CoreError::NoRefundableFunds`] — balance covers it, but no lot
    ///   is refundable (all synthetic, drained, or outside the window).
    /// - [`CoreError::WalletBusy`] — lock wait exceeded.
    pub async fn withdraw(&self, user_id: Uuid, tokens: u64) -> CoreResult<WithdrawalReport> {
        if tokens == 0 {
            return Err(CoreError::invalid_amount(
                "withdrawal amount must be positive",
            ));
        }
        if self.settings.withdraw_mode == WithdrawMode::Disabled {
            return Err(CoreError::Disabled);
        }

        let _guard = self.wallet.locks().acquire(user_id).await?;

        let available = self.wallet.balance(&user_id)?;
        if available < tokens {
            return Err(CoreError::Insufficient {
                available,
                requested: tokens,
            });
        }

        let window_start = Utc::now() - Duration::days(self.settings.refund_window_days);
        let refundable: Vec<_> = self
            .db
            .allocations(&user_id)?
            .into_iter()
            .filter(|lot| lot.is_refundable(window_start))
            .collect();
        if refundable.is_empty() {
            return Err(CoreError::NoRefundableFunds);
        }

        // Walk the lots oldest-first, refunding externally. Nothing is
        // written until the walk is done.
        let mut outstanding = tokens;
        let mut executed: Vec<(crate::wallet::Allocation, u64, String)> = Vec::new();
        for mut lot in refundable {
            if outstanding == 0 {
                break;
            }
            let take = outstanding.min(lot.remaining);
            let cents = take * self.settings.token_price_cents;

            let Some(payment_ref) = lot.payment_ref.clone() else {
                continue;
            };
            match self.processor.refund_payment(&payment_ref, cents).await {
                Ok(external_refund_id) => {
                    lot.remaining -= take;
                    outstanding -= take;
                    executed.push((lot, take, external_refund_id));
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        allocation_id = %lot.id,
                        payment_ref = %payment_ref,
                        error = %e,
                        "refund failed for lot, continuing with next"
                    );
                }
            }
        }

        let refunded = tokens - outstanding;
        if refunded == 0 {
            // Capacity existed but every refund failed. Nothing moved.
            return Ok(WithdrawalReport {
                requested: tokens,
                refunded: 0,
                refund_ids: Vec::new(),
                partial: true,
            });
        }

        // One WITHDRAWAL entry for what actually left the system. The
        // lot decrements are written explicitly — only the lots whose
        // refunds succeeded move, which is not necessarily a FIFO prefix
        // when the processor rejected one in the middle.
        let entry = self.wallet.ledger().append(
            user_id,
            EntryKind::Withdrawal,
            -(refunded as i64),
            None,
            Some(format!("refunded across {} lots", executed.len())),
        )?;

        let mut refund_ids = Vec::with_capacity(executed.len());
        for (lot, take, external_refund_id) in &executed {
            self.db.put_allocation(lot)?;
            let refund = Refund {
                id: Uuid::new_v4(),
                user_id,
                allocation_id: lot.id,
                amount: *take,
                external_refund_id: external_refund_id.clone(),
                withdrawal_entry_id: entry.id,
                created_at: Utc::now(),
            };
            self.db.put_refund(&refund)?;
            refund_ids.push(refund.id);
        }
        self.db.flush()?;

        tracing::info!(
            user_id = %user_id,
            requested = tokens,
            refunded,
            lots = executed.len(),
            "withdrawal completed"
        );

        Ok(WithdrawalReport {
            requested: tokens,
            refunded,
            refund_ids,
            partial: refunded < tokens,
        })
    }
}
