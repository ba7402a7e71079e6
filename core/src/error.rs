//! # Core Error Types
//!
//! Every failure the financial core can produce, as one tagged enum.
//! Components below the HTTP boundary return these explicitly; the API
//! layer in `chally-node` is the single place they are translated to
//! status codes. Nothing throws past a storage commit.
//!
//! [`CoreError::Duplicate`] is special: it is how the ledger reports an
//! idempotency-key collision, and call sites resolve it to success (the
//! original entry id is carried on the variant). It must never reach a
//! client as an error.

use uuid::Uuid;

use crate::processor::ProcessorError;

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by wallet, deposit, withdrawal, and settlement
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Amount is zero, negative, violates the entry-kind sign, or exceeds
    /// the hard per-operation cap.
    #[error("invalid amount: {detail}")]
    InvalidAmount {
        /// Human-readable explanation, safe to surface.
        detail: String,
    },

    /// The operation would push the user past the daily deposit ceiling.
    #[error("daily deposit limit exceeded: {used} of {cap} tokens used today, {requested} requested")]
    DailyLimit {
        /// The configured per-day cap in tokens.
        cap: u64,
        /// Tokens already deposited since UTC midnight.
        used: u64,
        /// Tokens the caller tried to deposit.
        requested: u64,
    },

    /// Balance is lower than the requested debit.
    #[error("insufficient balance: available {available}, requested {requested}")]
    Insufficient {
        /// The user's current balance in tokens.
        available: u64,
        /// The amount that was requested.
        requested: u64,
    },

    /// A withdrawal was attempted but no allocation is refundable: every
    /// lot is either consumed, synthetic (winnings), or outside the
    /// refund window.
    #[error("no refundable funds within the refund window")]
    NoRefundableFunds,

    /// The `(kind, external_id)` pair already exists in the ledger.
    ///
    /// This is the idempotency mechanism, not a user-facing failure.
    /// The surviving entry's id is carried so callers can return it as
    /// if the write had happened.
    #[error("duplicate external reference (existing entry {entry_id})")]
    Duplicate {
        /// Id of the ledger entry that already owns this external id.
        entry_id: Uuid,
    },

    /// Webhook signature mismatch, malformed signature header, or a
    /// timestamp outside the replay tolerance.
    #[error("invalid webhook signature: {detail}")]
    InvalidSignature {
        /// What failed. Never includes key material.
        detail: String,
    },

    /// The per-user (or per-challenge) advisory lock could not be
    /// acquired within the wait budget. Back off and retry.
    #[error("wallet is busy, try again")]
    WalletBusy,

    /// The operation is switched off by configuration.
    #[error("operation is disabled")]
    Disabled,

    /// The external payment processor failed non-retriably.
    #[error("payment processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// The referenced challenge, participant, or wallet row is missing.
    #[error("{what} not found")]
    NotFound {
        /// What was being looked up.
        what: &'static str,
    },

    /// A lifecycle rule was violated: terminal status transition,
    /// double join, settling a challenge that is not completed.
    #[error("state conflict: {detail}")]
    StateConflict {
        /// Human-readable explanation, safe to surface.
        detail: String,
    },

    /// Storage-layer failure (sled or serialization).
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for CoreError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl CoreError {
    /// Convenience constructor for [`CoreError::InvalidAmount`].
    pub fn invalid_amount(detail: impl Into<String>) -> Self {
        CoreError::InvalidAmount {
            detail: detail.into(),
        }
    }

    /// Convenience constructor for [`CoreError::StateConflict`].
    pub fn state_conflict(detail: impl Into<String>) -> Self {
        CoreError::StateConflict {
            detail: detail.into(),
        }
    }
}
