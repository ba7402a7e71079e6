//! # Per-User Advisory Locks
//!
//! Every wallet mutation for a user runs under that user's exclusive
//! lock, so no two mutations of the same wallet can interleave. The locks
//! are advisory and in-process: one node owns the store, the lock table
//! is the serialization point in front of it.
//!
//! Two rules keep this deadlock-free:
//!
//! 1. Single-user operations hold exactly one user lock, never two.
//! 2. Settlement, which must credit many wallets under one consistent
//!    snapshot, acquires its locks through [`WalletLocks::acquire_many`],
//!    which sorts the user ids ascending before acquiring. All multi-lock
//!    holders agree on that global order.
//!
//! Acquisition waits at most [`WALLET_LOCK_WAIT`] before failing with
//! [`CoreError::WalletBusy`], so a wedged operation surfaces as a retry
//! signal instead of a hang.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::config::WALLET_LOCK_WAIT;
use crate::error::{CoreError, CoreResult};

/// RAII guard for one user's wallet. The lock is released on drop.
#[derive(Debug)]
pub struct WalletGuard {
    _inner: OwnedMutexGuard<()>,
    user_id: Uuid,
}

impl WalletGuard {
    /// The user this guard locks.
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

/// The process-wide table of per-user wallet locks.
///
/// Lock objects are created lazily on first use and kept for the process
/// lifetime — a dormant mutex is a few dozen bytes, and reusing the same
/// `Arc` per user is what makes the exclusion actually global.
#[derive(Debug, Default)]
pub struct WalletLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WalletLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the exclusive lock for one user.
    ///
    /// # Errors
    ///
    /// [`CoreError::WalletBusy`] if the lock is not acquired within
    /// [`WALLET_LOCK_WAIT`].
    pub async fn acquire(&self, user_id: Uuid) -> CoreResult<WalletGuard> {
        let lock = self.lock_for(user_id);
        match tokio::time::timeout(WALLET_LOCK_WAIT, lock.lock_owned()).await {
            Ok(guard) => Ok(WalletGuard {
                _inner: guard,
                user_id,
            }),
            Err(_) => {
                tracing::warn!(user_id = %user_id, "wallet lock wait exceeded");
                Err(CoreError::WalletBusy)
            }
        }
    }

    /// Acquires locks for a set of users in ascending user-id order.
    ///
    /// Duplicates are collapsed. If any acquisition times out, all guards
    /// taken so far are released before returning.
    pub async fn acquire_many(&self, user_ids: &[Uuid]) -> CoreResult<Vec<WalletGuard>> {
        let mut ordered: Vec<Uuid> = user_ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for user_id in ordered {
            match self.acquire(user_id).await {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    // Guards drop here, releasing everything taken so far.
                    return Err(e);
                }
            }
        }
        Ok(guards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release() {
        let locks = WalletLocks::new();
        let user = Uuid::new_v4();

        let guard = locks.acquire(user).await.unwrap();
        assert_eq!(guard.user_id(), user);
        drop(guard);

        // Re-acquirable after release.
        let _guard = locks.acquire(user).await.unwrap();
    }

    #[tokio::test]
    async fn distinct_users_do_not_contend() {
        let locks = WalletLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await.unwrap();
        let _b = locks.acquire(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_times_out_with_busy() {
        let locks = Arc::new(WalletLocks::new());
        let user = Uuid::new_v4();

        let _held = locks.acquire(user).await.unwrap();

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(user).await })
        };

        tokio::time::advance(WALLET_LOCK_WAIT + Duration::from_millis(10)).await;
        let result = contender.await.unwrap();
        assert!(matches!(result, Err(CoreError::WalletBusy)));
    }

    #[tokio::test]
    async fn acquire_many_collapses_duplicates() {
        let locks = WalletLocks::new();
        let user = Uuid::new_v4();

        // The same id twice must not self-deadlock.
        let guards = locks.acquire_many(&[user, user]).await.unwrap();
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn acquire_many_orders_ascending() {
        let locks = WalletLocks::new();
        let mut users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        let guards = locks.acquire_many(&users).await.unwrap();
        users.sort();
        let held: Vec<Uuid> = guards.iter().map(|g| g.user_id()).collect();
        assert_eq!(held, users);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_many_releases_on_failure() {
        let locks = Arc::new(WalletLocks::new());
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        // Hold `b` so the batch acquisition fails partway through.
        let held_b = locks.acquire(b).await.unwrap();

        let batch = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire_many(&[a, b]).await })
        };
        tokio::time::advance(WALLET_LOCK_WAIT + Duration::from_millis(10)).await;
        assert!(matches!(batch.await.unwrap(), Err(CoreError::WalletBusy)));

        drop(held_b);
        // `a` must have been released by the failed batch.
        let _a = locks.acquire(a).await.unwrap();
        let _b = locks.acquire(b).await.unwrap();
    }
}
