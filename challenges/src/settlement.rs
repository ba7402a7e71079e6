//! # Settlement Engine
//!
//! Closes a challenge and distributes its stake pool. The stakes were
//! already debited at join time, so settlement is purely a payout
//! problem:
//!
//! - **Winners exist** — the pool divides by integer division. The
//!   remainder goes +1 token each to the earliest joiners (ties broken
//!   by user id), so every node computes the identical payout vector.
//! - **Nobody won** — the whole pool is forfeited to the platform
//!   treasury as a single payout.
//!
//! Settlement holds the challenge lock plus the wallet locks of every
//! recipient (acquired in ascending user-id order) so the credits land
//! as one consistent snapshot and cannot deadlock against concurrent
//! single-wallet operations.
//!
//! ## Idempotency, twice over
//!
//! The challenge's terminal status is the coarse guard: settling a
//! `Settled` challenge returns the stored outcome unchanged, with no
//! writes. Underneath, every payout carries an external reference
//! derived from `(challenge, recipient)`, so even a job retry that
//! crashed between credits cannot pay anyone twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Tree;
use uuid::Uuid;

use chally_core::error::{CoreError, CoreResult};
use chally_core::storage::CoreDb;
use chally_core::wallet::{CreditKind, Wallet};

use crate::challenge::{ChallengeLocks, ChallengeRegistry, ChallengeStatus};
use crate::participant::ParticipantStatus;

// ---------------------------------------------------------------------------
// Outcome Types
// ---------------------------------------------------------------------------

/// One payout made by a settlement or cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutShare {
    /// The credited user.
    pub user_id: Uuid,
    /// Tokens credited.
    pub amount: u64,
    /// The PAYOUT ledger entry.
    pub entry_id: Uuid,
}

/// The result of settling one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    /// The settled challenge.
    pub challenge_id: Uuid,
    /// Sum of all stakes collected, in tokens.
    pub total_pool: u64,
    /// Number of participants who completed the challenge.
    pub winner_count: u32,
    /// Base share per winner (integer division), 0 when nobody won.
    pub per_winner: u64,
    /// Tokens distributed as +1 bonuses to the earliest joiners.
    pub remainder: u64,
    /// Every winner credit, in payout order.
    pub recipients: Vec<PayoutShare>,
    /// Tokens forfeited to the platform treasury.
    pub platform_revenue: u64,
    /// When settlement committed (UTC).
    pub settled_at: DateTime<Utc>,
}

/// The result of cancelling one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationOutcome {
    /// The cancelled challenge.
    pub challenge_id: Uuid,
    /// Every stake returned, one payout per participant.
    pub returned: Vec<PayoutShare>,
    /// When cancellation committed (UTC).
    pub cancelled_at: DateTime<Utc>,
}

/// What the settlement journal stores per terminal challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum SettlementRecord {
    Settled(SettlementOutcome),
    Cancelled(CancellationOutcome),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// End-of-challenge stake distribution.
#[derive(Clone)]
pub struct SettlementEngine {
    db: Arc<CoreDb>,
    registry: Arc<ChallengeRegistry>,
    wallet: Wallet,
    locks: Arc<ChallengeLocks>,
    journal: Tree,
    platform_user_id: Uuid,
}

impl SettlementEngine {
    /// Creates the engine over the shared store, registry, and wallet.
    pub fn new(
        db: Arc<CoreDb>,
        registry: Arc<ChallengeRegistry>,
        wallet: Wallet,
        locks: Arc<ChallengeLocks>,
        platform_user_id: Uuid,
    ) -> CoreResult<Self> {
        let journal = db.open_tree("settlements")?;
        Ok(Self {
            db,
            registry,
            wallet,
            locks,
            journal,
            platform_user_id,
        })
    }

    /// Settles a completed challenge.
    ///
    /// Idempotent on `Settled`: the stored outcome is returned unchanged
    /// and nothing is written.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for an unknown challenge,
    /// [`CoreError::StateConflict`] when the challenge is not
    /// `Completed` (or was cancelled), [`CoreError::WalletBusy`] on
    /// lock timeouts.
    pub async fn settle(&self, challenge_id: Uuid) -> CoreResult<SettlementOutcome> {
        let _challenge_guard = self.locks.acquire(challenge_id).await?;

        let challenge = self.registry.get(&challenge_id)?;
        match challenge.status {
            ChallengeStatus::Settled => {
                return match self.load_record(&challenge_id)? {
                    Some(SettlementRecord::Settled(outcome)) => Ok(outcome),
                    _ => Err(CoreError::Storage(format!(
                        "settled challenge {challenge_id} has no settlement record"
                    ))),
                };
            }
            ChallengeStatus::Cancelled => {
                return Err(CoreError::state_conflict("challenge was cancelled"));
            }
            ChallengeStatus::Completed => {}
            other => {
                return Err(CoreError::state_conflict(format!(
                    "challenge is {other}, settlement requires Completed"
                )));
            }
        }

        let participants = self.registry.participants(&challenge_id)?;
        let total_pool = participants.len() as u64 * challenge.stake;

        // Winners in deterministic payout order: earliest joiner first,
        // user id as the tie-break.
        let mut winners: Vec<_> = participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Completed)
            .collect();
        winners.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        let outcome = if winners.is_empty() {
            // Full forfeiture: the pool goes to the treasury as one payout.
            let mut recipients = Vec::new();
            if total_pool > 0 {
                let _guards = self
                    .wallet
                    .locks()
                    .acquire_many(&[self.platform_user_id])
                    .await?;
                let entry_id = self.wallet.credit_unlocked(
                    self.platform_user_id,
                    total_pool,
                    CreditKind::Payout,
                    Some(&payout_reference("settle", &challenge_id, &self.platform_user_id)),
                    None,
                )?;
                recipients.push(PayoutShare {
                    user_id: self.platform_user_id,
                    amount: total_pool,
                    entry_id,
                });
            }
            SettlementOutcome {
                challenge_id,
                total_pool,
                winner_count: 0,
                per_winner: 0,
                remainder: 0,
                recipients,
                platform_revenue: total_pool,
                settled_at: Utc::now(),
            }
        } else {
            let winner_count = winners.len() as u64;
            let per_winner = total_pool / winner_count;
            let remainder = total_pool % winner_count;

            // Hold every recipient's wallet lock (plus the treasury's) at
            // once, in ascending user-id order.
            let mut lock_ids: Vec<Uuid> = winners.iter().map(|w| w.user_id).collect();
            lock_ids.push(self.platform_user_id);
            let _guards = self.wallet.locks().acquire_many(&lock_ids).await?;

            let mut recipients = Vec::with_capacity(winners.len());
            for (index, winner) in winners.iter().enumerate() {
                let amount = if (index as u64) < remainder {
                    per_winner + 1
                } else {
                    per_winner
                };
                let entry_id = self.wallet.credit_unlocked(
                    winner.user_id,
                    amount,
                    CreditKind::Payout,
                    Some(&payout_reference("settle", &challenge_id, &winner.user_id)),
                    None,
                )?;
                recipients.push(PayoutShare {
                    user_id: winner.user_id,
                    amount,
                    entry_id,
                });
            }

            SettlementOutcome {
                challenge_id,
                total_pool,
                winner_count: winners.len() as u32,
                per_winner,
                remainder,
                recipients,
                platform_revenue: 0,
                settled_at: Utc::now(),
            }
        };

        self.registry
            .transition(&challenge_id, ChallengeStatus::Settled)?;
        self.store_record(&challenge_id, &SettlementRecord::Settled(outcome.clone()))?;
        self.db.flush()?;

        tracing::info!(
            challenge_id = %challenge_id,
            total_pool = outcome.total_pool,
            winners = outcome.winner_count,
            platform_revenue = outcome.platform_revenue,
            "challenge settled"
        );

        Ok(outcome)
    }

    /// Cancels a challenge, returning every participant's stake as a
    /// payout (a synthetic lot — returned stakes are not card-refundable).
    ///
    /// Idempotent on `Cancelled`; refuses `Settled`.
    pub async fn cancel(&self, challenge_id: Uuid) -> CoreResult<CancellationOutcome> {
        let _challenge_guard = self.locks.acquire(challenge_id).await?;

        let challenge = self.registry.get(&challenge_id)?;
        match challenge.status {
            ChallengeStatus::Cancelled => {
                return match self.load_record(&challenge_id)? {
                    Some(SettlementRecord::Cancelled(outcome)) => Ok(outcome),
                    _ => Err(CoreError::Storage(format!(
                        "cancelled challenge {challenge_id} has no cancellation record"
                    ))),
                };
            }
            ChallengeStatus::Settled => {
                return Err(CoreError::state_conflict("challenge is already settled"));
            }
            _ => {}
        }

        let participants = self.registry.participants(&challenge_id)?;
        let lock_ids: Vec<Uuid> = participants.iter().map(|p| p.user_id).collect();
        let _guards = self.wallet.locks().acquire_many(&lock_ids).await?;

        let mut returned = Vec::with_capacity(participants.len());
        for participant in &participants {
            let entry_id = self.wallet.credit_unlocked(
                participant.user_id,
                challenge.stake,
                CreditKind::Payout,
                Some(&payout_reference("cancel", &challenge_id, &participant.user_id)),
                None,
            )?;
            returned.push(PayoutShare {
                user_id: participant.user_id,
                amount: challenge.stake,
                entry_id,
            });
        }

        let outcome = CancellationOutcome {
            challenge_id,
            returned,
            cancelled_at: Utc::now(),
        };
        self.registry
            .transition(&challenge_id, ChallengeStatus::Cancelled)?;
        self.store_record(&challenge_id, &SettlementRecord::Cancelled(outcome.clone()))?;
        self.db.flush()?;

        tracing::info!(
            challenge_id = %challenge_id,
            stakes_returned = outcome.returned.len(),
            "challenge cancelled"
        );

        Ok(outcome)
    }

    fn load_record(&self, challenge_id: &Uuid) -> CoreResult<Option<SettlementRecord>> {
        match self.journal.get(challenge_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_record(&self, challenge_id: &Uuid, record: &SettlementRecord) -> CoreResult<()> {
        let bytes = bincode::serialize(record)?;
        self.journal.insert(challenge_id.as_bytes(), bytes)?;
        Ok(())
    }
}

/// The idempotency reference for a settlement/cancellation payout.
fn payout_reference(action: &str, challenge_id: &Uuid, user_id: &Uuid) -> String {
    format!("{action}:{challenge_id}:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::Participant;
    use chally_core::ledger::Ledger;
    use chally_core::wallet::WalletLocks;
    use chrono::Duration;

    struct Fixture {
        engine: SettlementEngine,
        registry: Arc<ChallengeRegistry>,
        wallet: Wallet,
        platform: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(CoreDb::open_temporary().expect("temp db"));
        let ledger = Ledger::new(Arc::clone(&db), "USD");
        let wallet = Wallet::new(Arc::clone(&db), ledger, Arc::new(WalletLocks::new()));
        let registry = Arc::new(ChallengeRegistry::new(&db).unwrap());
        let platform = Uuid::nil();
        let engine = SettlementEngine::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            wallet.clone(),
            Arc::new(ChallengeLocks::new()),
            platform,
        )
        .unwrap();
        Fixture {
            engine,
            registry,
            wallet,
            platform,
        }
    }

    /// Creates a completed challenge with participants in the given
    /// statuses, joined one minute apart in vector order.
    fn completed_challenge(f: &Fixture, stake: u64, statuses: &[ParticipantStatus]) -> (Uuid, Vec<Uuid>) {
        let challenge = f
            .registry
            .create(
                Uuid::new_v4(),
                stake,
                Utc::now() - Duration::hours(25),
                Utc::now() - Duration::hours(1),
                None,
                2,
                false,
            )
            .unwrap();
        f.registry.activate(&challenge.id).unwrap();

        let base = Utc::now() - Duration::hours(24);
        let mut users = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let user = Uuid::new_v4();
            f.registry
                .add_participant(&Participant {
                    id: Uuid::new_v4(),
                    challenge_id: challenge.id,
                    user_id: user,
                    status: *status,
                    joined_at: base + Duration::minutes(i as i64),
                    stake_entry_id: Uuid::new_v4(),
                })
                .unwrap();
            users.push(user);
        }
        f.registry.mark_completed(&challenge.id).unwrap();
        (challenge.id, users)
    }

    #[tokio::test]
    async fn zero_winner_pool_goes_to_treasury() {
        let f = fixture();
        let (challenge_id, _users) = completed_challenge(
            &f,
            50,
            &[ParticipantStatus::Failed; 5],
        );

        let outcome = f.engine.settle(challenge_id).await.unwrap();

        assert_eq!(outcome.total_pool, 250);
        assert_eq!(outcome.winner_count, 0);
        assert_eq!(outcome.platform_revenue, 250);
        assert_eq!(outcome.recipients.len(), 1);
        assert_eq!(outcome.recipients[0].user_id, f.platform);
        assert_eq!(f.wallet.balance(&f.platform).unwrap(), 250);
    }

    #[tokio::test]
    async fn remainder_goes_to_earliest_joiners() {
        let f = fixture();
        // Pool: 4 participants x 25 = 100 tokens, 3 winners -> 33 each,
        // remainder 1 to the earliest-joining winner.
        let (challenge_id, users) = completed_challenge(
            &f,
            25,
            &[
                ParticipantStatus::Completed,
                ParticipantStatus::Completed,
                ParticipantStatus::Completed,
                ParticipantStatus::Failed,
            ],
        );

        let outcome = f.engine.settle(challenge_id).await.unwrap();

        assert_eq!(outcome.total_pool, 100);
        assert_eq!(outcome.per_winner, 33);
        assert_eq!(outcome.remainder, 1);
        assert_eq!(outcome.platform_revenue, 0);

        let amounts: Vec<u64> = outcome.recipients.iter().map(|r| r.amount).collect();
        assert_eq!(amounts, vec![34, 33, 33]);
        assert_eq!(outcome.recipients[0].user_id, users[0]);

        assert_eq!(f.wallet.balance(&users[0]).unwrap(), 34);
        assert_eq!(f.wallet.balance(&users[1]).unwrap(), 33);
        assert_eq!(f.wallet.balance(&users[2]).unwrap(), 33);
        assert_eq!(f.wallet.balance(&users[3]).unwrap(), 0);
        assert_eq!(f.wallet.balance(&f.platform).unwrap(), 0);
    }

    #[tokio::test]
    async fn payouts_plus_revenue_equal_pool() {
        let f = fixture();
        let (challenge_id, _users) = completed_challenge(
            &f,
            17,
            &[
                ParticipantStatus::Completed,
                ParticipantStatus::Failed,
                ParticipantStatus::Completed,
                ParticipantStatus::Failed,
                ParticipantStatus::Completed,
            ],
        );

        let outcome = f.engine.settle(challenge_id).await.unwrap();
        let distributed: u64 = outcome.recipients.iter().map(|r| r.amount).sum();
        assert_eq!(distributed + outcome.platform_revenue, outcome.total_pool);
    }

    #[tokio::test]
    async fn settle_is_idempotent() {
        let f = fixture();
        let (challenge_id, users) = completed_challenge(
            &f,
            50,
            &[ParticipantStatus::Completed, ParticipantStatus::Failed],
        );

        let first = f.engine.settle(challenge_id).await.unwrap();
        let ledger_rows = f.wallet.ledger().entries(&users[0]).unwrap().len();

        let second = f.engine.settle(challenge_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            f.wallet.ledger().entries(&users[0]).unwrap().len(),
            ledger_rows
        );
        assert_eq!(f.wallet.balance(&users[0]).unwrap(), 100);
    }

    #[tokio::test]
    async fn settle_requires_completed() {
        let f = fixture();
        let challenge = f
            .registry
            .create(
                Uuid::new_v4(),
                50,
                Utc::now() + Duration::hours(1),
                Utc::now() + Duration::hours(2),
                None,
                2,
                false,
            )
            .unwrap();
        f.registry.activate(&challenge.id).unwrap();

        let err = f.engine.settle(challenge.id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn settle_unknown_challenge_not_found() {
        let f = fixture();
        let err = f.engine.settle(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn sole_winner_takes_whole_pool() {
        let f = fixture();
        let (challenge_id, users) = completed_challenge(
            &f,
            200,
            &[ParticipantStatus::Completed],
        );

        let outcome = f.engine.settle(challenge_id).await.unwrap();
        assert_eq!(outcome.total_pool, 200);
        assert_eq!(outcome.per_winner, 200);
        assert_eq!(outcome.remainder, 0);
        assert_eq!(f.wallet.balance(&users[0]).unwrap(), 200);
    }

    #[tokio::test]
    async fn cancel_returns_all_stakes() {
        let f = fixture();
        let (challenge_id, users) = completed_challenge(
            &f,
            75,
            &[
                ParticipantStatus::Completed,
                ParticipantStatus::Failed,
                ParticipantStatus::Joined,
            ],
        );

        let outcome = f.engine.cancel(challenge_id).await.unwrap();
        assert_eq!(outcome.returned.len(), 3);
        for user in &users {
            assert_eq!(f.wallet.balance(user).unwrap(), 75);
        }
        assert_eq!(f.wallet.balance(&f.platform).unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let f = fixture();
        let (challenge_id, users) =
            completed_challenge(&f, 75, &[ParticipantStatus::Joined]);

        let first = f.engine.cancel(challenge_id).await.unwrap();
        let second = f.engine.cancel(challenge_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.wallet.balance(&users[0]).unwrap(), 75);
    }

    #[tokio::test]
    async fn cancel_after_settle_rejected() {
        let f = fixture();
        let (challenge_id, _users) =
            completed_challenge(&f, 50, &[ParticipantStatus::Completed]);

        f.engine.settle(challenge_id).await.unwrap();
        let err = f.engine.cancel(challenge_id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn settle_after_cancel_rejected() {
        let f = fixture();
        let (challenge_id, _users) =
            completed_challenge(&f, 50, &[ParticipantStatus::Completed]);

        f.engine.cancel(challenge_id).await.unwrap();
        let err = f.engine.settle(challenge_id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn empty_challenge_settles_to_nothing() {
        let f = fixture();
        let (challenge_id, _users) = completed_challenge(&f, 50, &[]);

        let outcome = f.engine.settle(challenge_id).await.unwrap();
        assert_eq!(outcome.total_pool, 0);
        assert_eq!(outcome.platform_revenue, 0);
        assert!(outcome.recipients.is_empty());
        assert_eq!(f.wallet.balance(&f.platform).unwrap(), 0);
    }
}
