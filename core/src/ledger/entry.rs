//! Core type definitions for ledger entries.
//!
//! These types form the vocabulary of every token movement in the system.
//! An entry is created once, with its sign fixed by its kind, and is never
//! updated or deleted afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EntryKind
// ---------------------------------------------------------------------------

/// Discriminant for the movement a ledger entry represents.
///
/// The kind fixes the sign of the entry's amount: money entering the
/// wallet (deposits, payouts) is positive, money leaving (stakes,
/// withdrawals) is negative. The pairing is enforced at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Tokens purchased through the payment processor.
    Deposit,
    /// Tokens locked into a challenge at join time.
    Stake,
    /// Tokens won from a settled challenge (or returned on cancellation).
    Payout,
    /// Tokens refunded back out through the payment processor.
    Withdrawal,
}

impl EntryKind {
    /// The sign every amount of this kind must carry: `+1` or `-1`.
    pub fn sign(&self) -> i64 {
        match self {
            EntryKind::Deposit | EntryKind::Payout => 1,
            EntryKind::Stake | EntryKind::Withdrawal => -1,
        }
    }

    /// Returns `true` if `amount` carries the sign this kind requires.
    /// Zero never matches — an entry that moves nothing is a bug upstream.
    pub fn sign_matches(&self, amount: i64) -> bool {
        match self.sign() {
            1 => amount > 0,
            _ => amount < 0,
        }
    }

    /// One-byte storage discriminant, used in the idempotency-index key.
    pub fn discriminant(&self) -> u8 {
        match self {
            EntryKind::Deposit => 0,
            EntryKind::Stake => 1,
            EntryKind::Payout => 2,
            EntryKind::Withdrawal => 3,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deposit => write!(f, "Deposit"),
            Self::Stake => write!(f, "Stake"),
            Self::Payout => write!(f, "Payout"),
            Self::Withdrawal => write!(f, "Withdrawal"),
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// A single immutable token movement.
///
/// `amount` is signed minor units (tokens): positive for credits, negative
/// for debits, per [`EntryKind::sign`]. `external_id`, when present, is the
/// payment processor's reference for this movement and doubles as the
/// idempotency key — `(kind, external_id)` is unique across the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub id: Uuid,
    /// The wallet this movement belongs to.
    pub user_id: Uuid,
    /// Position in the global commit sequence. Orders entries within a
    /// user; across users it carries no meaning beyond uniqueness.
    pub seq: u64,
    /// What kind of movement this is.
    pub kind: EntryKind,
    /// Signed amount in tokens.
    pub amount: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Payment-processor reference, unique per kind when present.
    pub external_id: Option<String>,
    /// Free-form annotation (challenge id for stakes, etc.).
    pub note: Option<String>,
    /// When the entry was committed (UTC).
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// The absolute token value of this movement.
    pub fn tokens(&self) -> u64 {
        self.amount.unsigned_abs()
    }
}
