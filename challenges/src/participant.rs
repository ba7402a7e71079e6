//! # Participants & Enrollment
//!
//! Joining a challenge is the only place a stake is paid, and it is
//! all-or-nothing: the stake debit and the participant row are created
//! together or not at all. The checks run under the challenge lock so
//! concurrent joins cannot oversubscribe a capped challenge or double-
//! enroll a user.
//!
//! Marking a participant `Completed` or `Failed` belongs to the peer
//! verification subsystem; [`Enrollment::set_status`] is that
//! subsystem's write surface into the core.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chally_core::error::{CoreError, CoreResult};
use chally_core::wallet::{DebitKind, Wallet};

use crate::challenge::{ChallengeLocks, ChallengeRegistry, ChallengeStatus};

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Where a participant stands in a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    /// Joined and staked; outcome not yet decided.
    Joined,
    /// Verified as having completed the challenge. Wins a pool share.
    Completed,
    /// Verified as having failed (or never submitted). Forfeits the stake.
    Failed,
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined => write!(f, "Joined"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A user's membership in one challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Unique participant identifier.
    pub id: Uuid,
    /// The challenge joined.
    pub challenge_id: Uuid,
    /// The joining user.
    pub user_id: Uuid,
    /// Current verification outcome.
    pub status: ParticipantStatus,
    /// When the user joined (UTC). Settlement's remainder ordering key.
    pub joined_at: DateTime<Utc>,
    /// The STAKE ledger entry that paid for this membership.
    pub stake_entry_id: Uuid,
}

/// What a successful join paid and created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReceipt {
    /// The created participant row.
    pub participant_id: Uuid,
    /// The challenge joined.
    pub challenge_id: Uuid,
    /// Tokens debited as the stake.
    pub stake_paid: u64,
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// Join and verification-status operations.
#[derive(Clone)]
pub struct Enrollment {
    registry: Arc<ChallengeRegistry>,
    wallet: Wallet,
    locks: Arc<ChallengeLocks>,
}

impl Enrollment {
    /// Creates the enrollment service over the shared registry, wallet,
    /// and challenge lock table.
    pub fn new(
        registry: Arc<ChallengeRegistry>,
        wallet: Wallet,
        locks: Arc<ChallengeLocks>,
    ) -> Self {
        Self {
            registry,
            wallet,
            locks,
        }
    }

    /// Joins a user into a challenge, debiting the stake.
    ///
    /// Checks, in order: challenge exists and is `Active`, the joining
    /// window is open, capacity remains, the user has not joined before.
    /// Only then is the stake debited — a refused debit leaves no
    /// participant row.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`], [`CoreError::StateConflict`] (wrong
    /// status, window closed, full, double join),
    /// [`CoreError::Insufficient`], [`CoreError::WalletBusy`].
    pub async fn join(&self, user_id: Uuid, challenge_id: Uuid) -> CoreResult<JoinReceipt> {
        let _challenge_guard = self.locks.acquire(challenge_id).await?;

        let challenge = self.registry.get(&challenge_id)?;
        if challenge.status != ChallengeStatus::Active {
            return Err(CoreError::state_conflict(format!(
                "challenge is {}, joining requires Active",
                challenge.status
            )));
        }

        let now = Utc::now();
        let join_deadline = if challenge.allow_late_join {
            challenge.end_at
        } else {
            challenge.start_at
        };
        if now >= join_deadline {
            return Err(CoreError::state_conflict("joining window has closed"));
        }

        if let Some(max) = challenge.max_participants {
            if self.registry.participant_count(&challenge_id)? >= max {
                return Err(CoreError::state_conflict("challenge is full"));
            }
        }
        if self.registry.participant(&challenge_id, &user_id)?.is_some() {
            return Err(CoreError::state_conflict("user already joined"));
        }

        let stake_entry_id = self
            .wallet
            .debit(
                user_id,
                challenge.stake,
                DebitKind::Stake,
                Some(format!("stake for challenge {challenge_id}")),
            )
            .await?;

        let participant = Participant {
            id: Uuid::new_v4(),
            challenge_id,
            user_id,
            status: ParticipantStatus::Joined,
            joined_at: now,
            stake_entry_id,
        };
        self.registry.add_participant(&participant)?;

        tracing::info!(
            challenge_id = %challenge_id,
            user_id = %user_id,
            stake = challenge.stake,
            "participant joined"
        );

        Ok(JoinReceipt {
            participant_id: participant.id,
            challenge_id,
            stake_paid: challenge.stake,
        })
    }

    /// Records a verification outcome for a participant.
    ///
    /// Only valid while the challenge is not terminal — settlement has
    /// already read the statuses after that, and rewriting history does
    /// not move money back.
    pub fn set_status(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        status: ParticipantStatus,
    ) -> CoreResult<Participant> {
        let challenge = self.registry.get(&challenge_id)?;
        if challenge.status.is_terminal() {
            return Err(CoreError::state_conflict(format!(
                "challenge is {}, verification is closed",
                challenge.status
            )));
        }
        self.registry
            .set_participant_status(&challenge_id, &user_id, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chally_core::ledger::Ledger;
    use chally_core::storage::CoreDb;
    use chally_core::wallet::{CreditKind, WalletLocks};
    use chrono::Duration;

    struct Fixture {
        enrollment: Enrollment,
        registry: Arc<ChallengeRegistry>,
        wallet: Wallet,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(CoreDb::open_temporary().expect("temp db"));
        let ledger = Ledger::new(Arc::clone(&db), "USD");
        let wallet = Wallet::new(Arc::clone(&db), ledger, Arc::new(WalletLocks::new()));
        let registry = Arc::new(ChallengeRegistry::new(&db).unwrap());
        let enrollment = Enrollment::new(
            Arc::clone(&registry),
            wallet.clone(),
            Arc::new(ChallengeLocks::new()),
        );
        Fixture {
            enrollment,
            registry,
            wallet,
        }
    }

    async fn funded_user(wallet: &Wallet, tokens: u64) -> Uuid {
        let user = Uuid::new_v4();
        let payment_ref = format!("pi_{user}");
        wallet
            .credit(
                user,
                tokens,
                CreditKind::Deposit,
                Some(&payment_ref),
                Some(&payment_ref),
            )
            .await
            .unwrap();
        user
    }

    fn active_challenge(
        registry: &ChallengeRegistry,
        stake: u64,
        max_participants: Option<u32>,
    ) -> Uuid {
        let challenge = registry
            .create(
                Uuid::new_v4(),
                stake,
                Utc::now() + Duration::hours(1),
                Utc::now() + Duration::hours(25),
                max_participants,
                2,
                false,
            )
            .unwrap();
        registry.activate(&challenge.id).unwrap();
        challenge.id
    }

    #[tokio::test]
    async fn join_debits_stake_and_creates_row() {
        let f = fixture();
        let user = funded_user(&f.wallet, 1000).await;
        let challenge_id = active_challenge(&f.registry, 200, None);

        let receipt = f.enrollment.join(user, challenge_id).await.unwrap();

        assert_eq!(receipt.stake_paid, 200);
        assert_eq!(f.wallet.balance(&user).unwrap(), 800);

        let participant = f
            .registry
            .participant(&challenge_id, &user)
            .unwrap()
            .expect("row should exist");
        assert_eq!(participant.status, ParticipantStatus::Joined);
        assert_eq!(participant.id, receipt.participant_id);
    }

    #[tokio::test]
    async fn join_requires_active_status() {
        let f = fixture();
        let user = funded_user(&f.wallet, 1000).await;
        let draft = f
            .registry
            .create(
                Uuid::new_v4(),
                100,
                Utc::now() + Duration::hours(1),
                Utc::now() + Duration::hours(2),
                None,
                2,
                false,
            )
            .unwrap();

        let err = f.enrollment.join(user, draft.id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
        assert_eq!(f.wallet.balance(&user).unwrap(), 1000);
    }

    #[tokio::test]
    async fn join_after_start_rejected() {
        let f = fixture();
        let user = funded_user(&f.wallet, 1000).await;
        let challenge = f
            .registry
            .create(
                Uuid::new_v4(),
                100,
                Utc::now() - Duration::minutes(5),
                Utc::now() + Duration::hours(2),
                None,
                2,
                false,
            )
            .unwrap();
        f.registry.activate(&challenge.id).unwrap();

        let err = f.enrollment.join(user, challenge.id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn late_join_flag_extends_window_to_end() {
        let f = fixture();
        let user = funded_user(&f.wallet, 1000).await;
        let challenge = f
            .registry
            .create(
                Uuid::new_v4(),
                100,
                Utc::now() - Duration::minutes(5),
                Utc::now() + Duration::hours(2),
                None,
                2,
                true,
            )
            .unwrap();
        f.registry.activate(&challenge.id).unwrap();

        assert!(f.enrollment.join(user, challenge.id).await.is_ok());
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let f = fixture();
        let challenge_id = active_challenge(&f.registry, 100, Some(2));

        for _ in 0..2 {
            let user = funded_user(&f.wallet, 500).await;
            f.enrollment.join(user, challenge_id).await.unwrap();
        }

        let third = funded_user(&f.wallet, 500).await;
        let err = f.enrollment.join(third, challenge_id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
        assert_eq!(f.wallet.balance(&third).unwrap(), 500);
    }

    #[tokio::test]
    async fn double_join_rejected_without_second_debit() {
        let f = fixture();
        let user = funded_user(&f.wallet, 1000).await;
        let challenge_id = active_challenge(&f.registry, 200, None);

        f.enrollment.join(user, challenge_id).await.unwrap();
        let err = f.enrollment.join(user, challenge_id).await.unwrap_err();

        assert!(matches!(err, CoreError::StateConflict { .. }));
        assert_eq!(f.wallet.balance(&user).unwrap(), 800);
    }

    #[tokio::test]
    async fn insufficient_funds_leave_no_row() {
        let f = fixture();
        let user = funded_user(&f.wallet, 50).await;
        let challenge_id = active_challenge(&f.registry, 200, None);

        let err = f.enrollment.join(user, challenge_id).await.unwrap_err();
        assert!(matches!(err, CoreError::Insufficient { .. }));
        assert!(f
            .registry
            .participant(&challenge_id, &user)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unknown_challenge_is_not_found() {
        let f = fixture();
        let user = funded_user(&f.wallet, 500).await;
        let err = f.enrollment.join(user, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn verification_writes_status() {
        let f = fixture();
        let user = funded_user(&f.wallet, 500).await;
        let challenge_id = active_challenge(&f.registry, 100, None);
        f.enrollment.join(user, challenge_id).await.unwrap();

        let updated = f
            .enrollment
            .set_status(challenge_id, user, ParticipantStatus::Completed)
            .unwrap();
        assert_eq!(updated.status, ParticipantStatus::Completed);
    }

    #[tokio::test]
    async fn verification_closed_after_terminal() {
        let f = fixture();
        let user = funded_user(&f.wallet, 500).await;
        let challenge_id = active_challenge(&f.registry, 100, None);
        f.enrollment.join(user, challenge_id).await.unwrap();

        f.registry
            .transition(&challenge_id, ChallengeStatus::Cancelled)
            .unwrap();

        let err = f
            .enrollment
            .set_status(challenge_id, user, ParticipantStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));
    }
}
