//! # Wallet Operations
//!
//! The write path for one user's money. A wallet operation is: take the
//! user's advisory lock, validate everything, then write the ledger entry
//! and the allocation updates together and flush. All validation happens
//! before the first write, so a failed operation leaves no partial rows.
//!
//! ## The dual write
//!
//! Every credit writes a ledger entry *and* an allocation; every debit
//! writes a ledger entry *and* decrements allocations FIFO. This keeps
//!
//! ```text
//! balance(u) == Σ ledger.amount(u) == Σ allocation.remaining(u) ≥ 0
//! ```
//!
//! true at every commit. Stake debits consume allocation capacity just
//! like withdrawals do — a staked token is no longer refundable even if
//! the stake later comes back as winnings.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::ledger::{EntryKind, Ledger};
use crate::storage::CoreDb;
use crate::wallet::allocation::Allocation;
use crate::wallet::locks::WalletLocks;

// ---------------------------------------------------------------------------
// Operation Kinds
// ---------------------------------------------------------------------------

/// The two ways tokens enter a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditKind {
    /// A confirmed purchase through the payment processor.
    Deposit,
    /// Challenge winnings or a cancellation return.
    Payout,
}

impl CreditKind {
    fn entry_kind(&self) -> EntryKind {
        match self {
            CreditKind::Deposit => EntryKind::Deposit,
            CreditKind::Payout => EntryKind::Payout,
        }
    }
}

/// The two ways tokens leave a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitKind {
    /// Tokens locked into a challenge at join time.
    Stake,
    /// Tokens refunded out through the payment processor.
    Withdrawal,
}

impl DebitKind {
    fn entry_kind(&self) -> EntryKind {
        match self {
            DebitKind::Stake => EntryKind::Stake,
            DebitKind::Withdrawal => EntryKind::Withdrawal,
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Serialized balance operations over the ledger and allocation index.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Debug, Clone)]
pub struct Wallet {
    db: Arc<CoreDb>,
    ledger: Ledger,
    locks: Arc<WalletLocks>,
}

impl Wallet {
    /// Creates a wallet service over the shared store and lock table.
    pub fn new(db: Arc<CoreDb>, ledger: Ledger, locks: Arc<WalletLocks>) -> Self {
        Self { db, ledger, locks }
    }

    /// The shared per-user lock table. The settlement engine acquires
    /// locks through this and then uses the `_unlocked` operations.
    pub fn locks(&self) -> &Arc<WalletLocks> {
        &self.locks
    }

    /// The underlying ledger (balance and statement reads).
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The user's current balance in tokens.
    pub fn balance(&self, user_id: &Uuid) -> CoreResult<u64> {
        self.ledger.balance(user_id)
    }

    // -----------------------------------------------------------------------
    // Credit
    // -----------------------------------------------------------------------

    /// Credits tokens to a wallet under the user's lock.
    ///
    /// For deposits, `payment_ref` is the processor charge reference and
    /// makes the created lot refundable; payouts always create a synthetic
    /// (non-refundable) lot. When `external_id` is supplied the operation
    /// is idempotent: a second call with the same `(kind, external_id)`
    /// returns the original entry id and writes nothing.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidAmount`] on zero amounts, [`CoreError::WalletBusy`]
    /// on lock timeout.
    pub async fn credit(
        &self,
        user_id: Uuid,
        tokens: u64,
        kind: CreditKind,
        external_id: Option<&str>,
        payment_ref: Option<&str>,
    ) -> CoreResult<Uuid> {
        let _guard = self.locks.acquire(user_id).await?;
        self.credit_unlocked(user_id, tokens, kind, external_id, payment_ref)
    }

    /// [`credit`](Self::credit) without taking the lock.
    ///
    /// The caller must already hold `user_id`'s wallet lock (settlement
    /// does, for every recipient at once).
    pub fn credit_unlocked(
        &self,
        user_id: Uuid,
        tokens: u64,
        kind: CreditKind,
        external_id: Option<&str>,
        payment_ref: Option<&str>,
    ) -> CoreResult<Uuid> {
        if tokens == 0 {
            return Err(CoreError::invalid_amount("zero-amount credit"));
        }

        let entry = match self.ledger.append(
            user_id,
            kind.entry_kind(),
            tokens as i64,
            external_id,
            None,
        ) {
            Ok(entry) => entry,
            // Idempotent replay: the movement already happened.
            Err(CoreError::Duplicate { entry_id }) => {
                tracing::debug!(
                    user_id = %user_id,
                    external_id = external_id.unwrap_or("-"),
                    "duplicate credit resolved to existing entry"
                );
                return Ok(entry_id);
            }
            Err(e) => return Err(e),
        };

        let lot_payment_ref = match kind {
            CreditKind::Deposit => payment_ref.map(str::to_string),
            // Winnings cannot be refunded to a card.
            CreditKind::Payout => None,
        };

        self.db.put_allocation(&Allocation {
            id: Uuid::new_v4(),
            user_id,
            seq: entry.seq,
            original: tokens,
            remaining: tokens,
            payment_ref: lot_payment_ref,
            ledger_entry_id: entry.id,
            created_at: entry.created_at,
        })?;
        self.db.flush()?;

        Ok(entry.id)
    }

    // -----------------------------------------------------------------------
    // Debit
    // -----------------------------------------------------------------------

    /// Debits tokens from a wallet under the user's lock, consuming
    /// allocation capacity oldest-first.
    ///
    /// # Errors
    ///
    /// [`CoreError::Insufficient`] when the balance cannot cover the
    /// amount; [`CoreError::InvalidAmount`] on zero; [`CoreError::WalletBusy`]
    /// on lock timeout.
    pub async fn debit(
        &self,
        user_id: Uuid,
        tokens: u64,
        kind: DebitKind,
        note: Option<String>,
    ) -> CoreResult<Uuid> {
        let _guard = self.locks.acquire(user_id).await?;
        self.debit_unlocked(user_id, tokens, kind, note)
    }

    /// [`debit`](Self::debit) without taking the lock. The caller must
    /// already hold `user_id`'s wallet lock.
    pub fn debit_unlocked(
        &self,
        user_id: Uuid,
        tokens: u64,
        kind: DebitKind,
        note: Option<String>,
    ) -> CoreResult<Uuid> {
        if tokens == 0 {
            return Err(CoreError::invalid_amount("zero-amount debit"));
        }

        let available = self.ledger.balance(&user_id)?;
        if available < tokens {
            return Err(CoreError::Insufficient {
                available,
                requested: tokens,
            });
        }

        // Plan the FIFO consumption before writing anything.
        let mut outstanding = tokens;
        let mut consumed = Vec::new();
        for mut lot in self.db.allocations(&user_id)? {
            if outstanding == 0 {
                break;
            }
            if lot.remaining == 0 {
                continue;
            }
            let take = outstanding.min(lot.remaining);
            lot.remaining -= take;
            outstanding -= take;
            consumed.push(lot);
        }
        if outstanding > 0 {
            // Balance said yes but the lots cannot cover it: the dual
            // write has diverged, which no operation in this crate does.
            return Err(CoreError::Storage(format!(
                "allocation index diverged from ledger for user {user_id}"
            )));
        }

        let entry = self
            .ledger
            .append(user_id, kind.entry_kind(), -(tokens as i64), None, note)?;
        for lot in &consumed {
            self.db.put_allocation(lot)?;
        }
        self.db.flush()?;

        tracing::debug!(
            user_id = %user_id,
            tokens,
            lots = consumed.len(),
            "debit consumed allocations"
        );

        Ok(entry.id)
    }
}
