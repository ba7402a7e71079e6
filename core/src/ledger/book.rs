//! # The Ledger Book
//!
//! Append, sum, never rewrite. The ledger is the authoritative record of
//! every token movement; a user's balance is always recomputed from the
//! stored entries, so there is no cached scalar to drift out of sync.
//!
//! Two invariants are enforced at the append boundary:
//!
//! 1. **Sign** — an entry's amount must carry the sign its kind dictates
//!    (deposits/payouts positive, stakes/withdrawals negative, never zero).
//! 2. **Uniqueness** — `(kind, external_id)` appears at most once. A
//!    colliding append returns [`CoreError::Duplicate`] carrying the
//!    surviving entry's id, which is how webhook retries and job replays
//!    collapse into a single movement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::MAX_OPERATION_TOKENS;
use crate::error::{CoreError, CoreResult};
use crate::ledger::entry::{EntryKind, LedgerEntry};
use crate::storage::CoreDb;

/// The append-only ledger over [`CoreDb`].
///
/// Cheap to clone — shares the database handle.
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Arc<CoreDb>,
    currency: String,
}

impl Ledger {
    /// Creates a ledger over the given store, stamping `currency` on
    /// every new entry.
    pub fn new(db: Arc<CoreDb>, currency: &str) -> Self {
        Self {
            db,
            currency: currency.to_string(),
        }
    }

    /// Appends one entry.
    ///
    /// `amount` is signed; its sign must match `kind` and its magnitude
    /// must stay under the per-operation cap.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidAmount`] on a sign violation or an amount
    ///   over the cap.
    /// - [`CoreError::Duplicate`] when `(kind, external_id)` already
    ///   exists — the caller decides whether that is success.
    pub fn append(
        &self,
        user_id: Uuid,
        kind: EntryKind,
        amount: i64,
        external_id: Option<&str>,
        note: Option<String>,
    ) -> CoreResult<LedgerEntry> {
        if !kind.sign_matches(amount) {
            return Err(CoreError::invalid_amount(format!(
                "{kind} entries must be {}, got {amount}",
                if kind.sign() > 0 { "positive" } else { "negative" },
            )));
        }
        if amount.unsigned_abs() > MAX_OPERATION_TOKENS {
            return Err(CoreError::invalid_amount(format!(
                "amount {} exceeds the per-operation cap",
                amount.unsigned_abs()
            )));
        }

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            seq: self.db.next_seq()?,
            kind,
            amount,
            currency: self.currency.clone(),
            external_id: external_id.map(str::to_string),
            note,
            created_at: Utc::now(),
        };

        self.db.append_ledger_entry(&entry)?;

        tracing::debug!(
            user_id = %user_id,
            kind = %kind,
            amount,
            external_id = external_id.unwrap_or("-"),
            "ledger entry appended"
        );

        Ok(entry)
    }

    /// The user's balance in tokens: the sum of all their entry amounts,
    /// computed directly from storage.
    ///
    /// The sum is non-negative for any wallet written through this crate,
    /// since debits are refused when they would overdraw.
    pub fn balance(&self, user_id: &Uuid) -> CoreResult<u64> {
        let sum: i64 = self
            .db
            .ledger_entries(user_id)?
            .iter()
            .map(|e| e.amount)
            .sum();
        Ok(sum.max(0) as u64)
    }

    /// Sum of entry magnitudes of one kind since a cutoff instant.
    ///
    /// Used by the deposit pipeline for the UTC-midnight daily cap.
    pub fn sum_since(
        &self,
        user_id: &Uuid,
        kind: EntryKind,
        since: DateTime<Utc>,
    ) -> CoreResult<u64> {
        let total = self
            .db
            .ledger_entries(user_id)?
            .iter()
            .filter(|e| e.kind == kind && e.created_at >= since)
            .map(LedgerEntry::tokens)
            .sum();
        Ok(total)
    }

    /// Every entry for a user, oldest first. The wallet statement.
    pub fn entries(&self, user_id: &Uuid) -> CoreResult<Vec<LedgerEntry>> {
        self.db.ledger_entries(user_id)
    }
}
