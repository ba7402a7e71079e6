//! # Challenge Lifecycle & Registry
//!
//! A challenge moves through a fixed lifecycle:
//!
//! 1. **Draft** — created, not yet open for joining.
//! 2. **Active** — participants may join (and stake) until `start_at`.
//! 3. **Completed** — `end_at` has passed and verification is resolved;
//!    the challenge is ready to settle.
//! 4. **Settled** — the pool has been distributed. Terminal.
//! 5. **Cancelled** — stakes were returned. Terminal.
//!
//! Terminal means terminal: no operation moves a challenge out of
//! `Settled` or `Cancelled`, and the registry refuses the attempt with a
//! state conflict rather than silently ignoring it.
//!
//! The registry also owns participant rows, keyed by
//! `(challenge_id, user_id)` so membership uniqueness is a keyspace
//! property rather than a scan.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::Tree;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use chally_core::config::WALLET_LOCK_WAIT;
use chally_core::error::{CoreError, CoreResult};
use chally_core::storage::CoreDb;

use crate::participant::{Participant, ParticipantStatus};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// The current lifecycle status of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeStatus {
    /// Created but not yet open for joining.
    Draft,
    /// Open — users may join and stake.
    Active,
    /// Ended and verified; awaiting settlement.
    Completed,
    /// Pool distributed. Terminal.
    Settled,
    /// Stakes returned. Terminal.
    Cancelled,
}

impl ChallengeStatus {
    /// Returns `true` for the two statuses no challenge ever leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeStatus::Settled | ChallengeStatus::Cancelled)
    }

    /// Returns `true` if a transition from `self` to `to` is legal.
    fn allows(&self, to: ChallengeStatus) -> bool {
        use ChallengeStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Completed)
                | (Completed, Settled)
                | (Draft, Cancelled)
                | (Active, Cancelled)
                | (Completed, Cancelled)
        )
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "Draft"),
            Self::Active => write!(f, "Active"),
            Self::Completed => write!(f, "Completed"),
            Self::Settled => write!(f, "Settled"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

/// A time-bounded challenge with a fixed per-participant stake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// Unique challenge identifier.
    pub id: Uuid,
    /// The user who created the challenge.
    pub creator_id: Uuid,
    /// Stake every participant pays on join, in tokens.
    pub stake: u64,
    /// Cap on participant count, unlimited when absent.
    pub max_participants: Option<u32>,
    /// When the challenge begins. Joining closes here unless
    /// `allow_late_join` is set.
    pub start_at: DateTime<Utc>,
    /// When the challenge ends. Settlement becomes possible after this.
    pub end_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: ChallengeStatus,
    /// Peer verifications required for a submission to count.
    pub verification_threshold: u32,
    /// When set, joining stays open until `end_at` instead of `start_at`.
    pub allow_late_join: bool,
    /// When the challenge was created (UTC).
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// RAII guard for one challenge. Released on drop.
#[derive(Debug)]
pub struct ChallengeGuard {
    _inner: OwnedMutexGuard<()>,
}

/// Per-challenge advisory locks.
///
/// Serializes join, settlement, and cancellation per challenge. Lock
/// ordering with wallet locks is fixed: challenge lock first, then user
/// locks — every multi-lock holder in this crate follows it.
#[derive(Debug, Default)]
pub struct ChallengeLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ChallengeLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires the lock for one challenge, waiting at most the shared
    /// advisory-lock budget.
    ///
    /// # Errors
    ///
    /// [`CoreError::WalletBusy`] on timeout — same back-off contract as
    /// the wallet locks.
    pub async fn acquire(&self, challenge_id: Uuid) -> CoreResult<ChallengeGuard> {
        let lock = self
            .locks
            .entry(challenge_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match tokio::time::timeout(WALLET_LOCK_WAIT, lock.lock_owned()).await {
            Ok(guard) => Ok(ChallengeGuard { _inner: guard }),
            Err(_) => {
                tracing::warn!(challenge_id = %challenge_id, "challenge lock wait exceeded");
                Err(CoreError::WalletBusy)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Persistent challenge + participant store.
///
/// Backed by two dedicated trees in the shared [`CoreDb`]. All status
/// transitions funnel through [`transition`](Self::transition) so the
/// lifecycle rules live in exactly one place.
#[derive(Debug, Clone)]
pub struct ChallengeRegistry {
    challenges: Tree,
    participants: Tree,
}

impl ChallengeRegistry {
    /// Opens the registry's trees in the shared database.
    pub fn new(db: &CoreDb) -> CoreResult<Self> {
        Ok(Self {
            challenges: db.open_tree("challenges")?,
            participants: db.open_tree("participants")?,
        })
    }

    /// Creates a challenge in `Draft` status.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidAmount`] for a zero stake,
    /// [`CoreError::StateConflict`] for a window that ends before it
    /// starts.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        creator_id: Uuid,
        stake: u64,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        max_participants: Option<u32>,
        verification_threshold: u32,
        allow_late_join: bool,
    ) -> CoreResult<Challenge> {
        if stake == 0 {
            return Err(CoreError::invalid_amount("challenge stake must be positive"));
        }
        if end_at <= start_at {
            return Err(CoreError::state_conflict(
                "challenge must end after it starts",
            ));
        }

        let challenge = Challenge {
            id: Uuid::new_v4(),
            creator_id,
            stake,
            max_participants,
            start_at,
            end_at,
            status: ChallengeStatus::Draft,
            verification_threshold,
            allow_late_join,
            created_at: Utc::now(),
        };
        self.put(&challenge)?;

        tracing::info!(
            challenge_id = %challenge.id,
            creator_id = %creator_id,
            stake,
            "challenge created"
        );
        Ok(challenge)
    }

    /// Fetches a challenge by id.
    pub fn get(&self, challenge_id: &Uuid) -> CoreResult<Challenge> {
        match self.challenges.get(challenge_id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(CoreError::NotFound { what: "challenge" }),
        }
    }

    /// Moves a challenge to a new status, enforcing the lifecycle rules.
    ///
    /// # Errors
    ///
    /// [`CoreError::StateConflict`] for any transition the lifecycle
    /// does not allow — including every transition out of a terminal
    /// status.
    pub fn transition(&self, challenge_id: &Uuid, to: ChallengeStatus) -> CoreResult<Challenge> {
        let mut challenge = self.get(challenge_id)?;
        if !challenge.status.allows(to) {
            return Err(CoreError::state_conflict(format!(
                "challenge is {}, cannot become {}",
                challenge.status, to
            )));
        }
        challenge.status = to;
        self.put(&challenge)?;

        tracing::info!(challenge_id = %challenge_id, status = %to, "challenge transitioned");
        Ok(challenge)
    }

    /// Opens a draft challenge for joining.
    pub fn activate(&self, challenge_id: &Uuid) -> CoreResult<Challenge> {
        self.transition(challenge_id, ChallengeStatus::Active)
    }

    /// Marks an active challenge as ended and verification-resolved.
    pub fn mark_completed(&self, challenge_id: &Uuid) -> CoreResult<Challenge> {
        self.transition(challenge_id, ChallengeStatus::Completed)
    }

    /// Every challenge in the registry. Used by the settlement job scan.
    pub fn all(&self) -> CoreResult<Vec<Challenge>> {
        let mut out = Vec::new();
        for item in self.challenges.iter() {
            let (_key, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    fn put(&self, challenge: &Challenge) -> CoreResult<()> {
        let bytes = bincode::serialize(challenge)?;
        self.challenges.insert(challenge.id.as_bytes(), bytes)?;
        Ok(())
    }

    // -- Participants --------------------------------------------------------

    /// Inserts a participant row.
    ///
    /// # Errors
    ///
    /// [`CoreError::StateConflict`] if the `(challenge, user)` pair
    /// already exists.
    pub fn add_participant(&self, participant: &Participant) -> CoreResult<()> {
        let key = participant_key(&participant.challenge_id, &participant.user_id);
        if self.participants.get(key)?.is_some() {
            return Err(CoreError::state_conflict("user already joined"));
        }
        let bytes = bincode::serialize(participant)?;
        self.participants.insert(key, bytes)?;
        Ok(())
    }

    /// Fetches one participant row, if the user joined.
    pub fn participant(
        &self,
        challenge_id: &Uuid,
        user_id: &Uuid,
    ) -> CoreResult<Option<Participant>> {
        match self.participants.get(participant_key(challenge_id, user_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every participant of a challenge.
    pub fn participants(&self, challenge_id: &Uuid) -> CoreResult<Vec<Participant>> {
        let mut out = Vec::new();
        for item in self.participants.scan_prefix(challenge_id.as_bytes()) {
            let (_key, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Number of users who joined a challenge.
    pub fn participant_count(&self, challenge_id: &Uuid) -> CoreResult<u32> {
        Ok(self.participants.scan_prefix(challenge_id.as_bytes()).count() as u32)
    }

    /// Overwrites a participant's status.
    pub fn set_participant_status(
        &self,
        challenge_id: &Uuid,
        user_id: &Uuid,
        status: ParticipantStatus,
    ) -> CoreResult<Participant> {
        let mut participant = self
            .participant(challenge_id, user_id)?
            .ok_or(CoreError::NotFound {
                what: "participant",
            })?;
        participant.status = status;
        let bytes = bincode::serialize(&participant)?;
        self.participants
            .insert(participant_key(challenge_id, user_id), bytes)?;
        Ok(participant)
    }
}

/// `(challenge_id, user_id)` composite key — uniqueness by keyspace.
fn participant_key(challenge_id: &Uuid, user_id: &Uuid) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(challenge_id.as_bytes());
    key[16..].copy_from_slice(user_id.as_bytes());
    key
}
