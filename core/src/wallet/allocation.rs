//! FIFO deposit lots.
//!
//! Balance alone cannot drive a refund back to the card that funded it.
//! Each credit therefore also records an *allocation* — a lot with the
//! originating payment reference — and debits consume lots oldest-first.
//! The refund engine walks the same lots to decide where money can still
//! leave the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single deposit (or payout) lot.
///
/// Created once per credit; afterwards only `remaining` moves, and only
/// downwards. `payment_ref` distinguishes the two species of lot:
///
/// - `Some(ref)` — a real deposit. Refundable back to the originating
///   charge while inside the refund window.
/// - `None` — a synthetic lot from challenge winnings or cancellations.
///   Spendable on future stakes, never refundable to a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique lot identifier.
    pub id: Uuid,
    /// The wallet this lot belongs to.
    pub user_id: Uuid,
    /// Position in the global commit sequence; fixes FIFO order.
    pub seq: u64,
    /// The lot's size at creation, in tokens.
    pub original: u64,
    /// Unconsumed tokens, `0 ≤ remaining ≤ original`.
    pub remaining: u64,
    /// The processor's charge reference, absent on synthetic lots.
    pub payment_ref: Option<String>,
    /// The ledger entry that created this lot.
    pub ledger_entry_id: Uuid,
    /// When the lot was created (UTC).
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    /// Returns `true` if this lot can still be refunded externally:
    /// it has capacity left, a payment reference, and was created on or
    /// after `window_start`.
    pub fn is_refundable(&self, window_start: DateTime<Utc>) -> bool {
        self.remaining > 0 && self.payment_ref.is_some() && self.created_at >= window_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lot(remaining: u64, payment_ref: Option<&str>, age_days: i64) -> Allocation {
        Allocation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            seq: 1,
            original: 1000,
            remaining,
            payment_ref: payment_ref.map(str::to_string),
            ledger_entry_id: Uuid::new_v4(),
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn fresh_deposit_lot_is_refundable() {
        let window_start = Utc::now() - Duration::days(90);
        assert!(lot(500, Some("pi_1"), 10).is_refundable(window_start));
    }

    #[test]
    fn drained_lot_is_not_refundable() {
        let window_start = Utc::now() - Duration::days(90);
        assert!(!lot(0, Some("pi_1"), 10).is_refundable(window_start));
    }

    #[test]
    fn synthetic_lot_is_not_refundable() {
        let window_start = Utc::now() - Duration::days(90);
        assert!(!lot(500, None, 10).is_refundable(window_start));
    }

    #[test]
    fn lot_outside_window_is_not_refundable() {
        let window_start = Utc::now() - Duration::days(90);
        assert!(!lot(500, Some("pi_1"), 120).is_refundable(window_start));
    }
}
