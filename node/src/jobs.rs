//! # Settlement Worker
//!
//! A single background worker that closes challenges whose `end_at` has
//! passed. Two-step pipeline per tick:
//!
//! 1. **Scan** — every `Active` challenge past its end instant is marked
//!    `Completed` and a settlement job is enqueued.
//! 2. **Drain** — due jobs are popped from the durable queue and settled
//!    under the 30-second job timeout.
//!
//! The queue is a sled tree keyed by `due_at (8B BE) ‖ challenge_id`, so
//! a range scan up to "now" yields exactly the due jobs in due order.
//! Delivery is at-least-once: a job is removed only after its settlement
//! attempt resolves, and transient failures (lock timeouts, storage
//! hiccups, the job timeout itself) re-enqueue with a delay. Settlement
//! idempotency makes the redelivery harmless; permanent failures
//! (cancelled mid-flight, deleted challenge) drop the job.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sled::Tree;
use tokio::sync::watch;
use uuid::Uuid;

use chally_challenges::challenge::{ChallengeRegistry, ChallengeStatus};
use chally_challenges::settlement::SettlementEngine;
use chally_core::config::{SETTLEMENT_JOB_TIMEOUT, SETTLEMENT_RETRY_DELAY};
use chally_core::error::{CoreError, CoreResult};
use chally_core::storage::CoreDb;

use crate::metrics::SharedMetrics;

/// How often the worker wakes up to scan and drain.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Builds the 24-byte queue key: due instant, then challenge id.
fn queue_key(due_at: DateTime<Utc>, challenge_id: &Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&(due_at.timestamp_millis().max(0) as u64).to_be_bytes());
    key[8..].copy_from_slice(challenge_id.as_bytes());
    key
}

/// The settlement job worker.
pub struct SettlementWorker {
    registry: Arc<ChallengeRegistry>,
    settlement: SettlementEngine,
    queue: Tree,
    metrics: SharedMetrics,
}

impl SettlementWorker {
    /// Creates the worker, opening its durable queue tree.
    pub fn new(
        db: &CoreDb,
        registry: Arc<ChallengeRegistry>,
        settlement: SettlementEngine,
        metrics: SharedMetrics,
    ) -> CoreResult<Self> {
        Ok(Self {
            registry,
            settlement,
            queue: db.open_tree("settlement_queue")?,
            metrics,
        })
    }

    /// Enqueues a settlement job to run at (or after) `due_at`.
    ///
    /// Enqueueing the same challenge at the same instant is a no-op
    /// (same key), and enqueueing it at a different instant only costs a
    /// redundant settle call that the idempotency guard absorbs.
    pub fn enqueue(&self, challenge_id: Uuid, due_at: DateTime<Utc>) -> CoreResult<()> {
        self.queue
            .insert(queue_key(due_at, &challenge_id), challenge_id.as_bytes())?;
        self.metrics.settlement_queue_depth.set(self.queue.len() as i64);
        Ok(())
    }

    /// Jobs currently waiting. Test and metrics support.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// One scan + drain pass. Returns the number of challenges settled.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        if let Err(e) = self.scan_ended_challenges(now) {
            tracing::error!("challenge scan failed: {}", e);
        }
        let settled = self.drain_due_jobs(now).await;
        self.metrics.settlement_queue_depth.set(self.queue.len() as i64);
        settled
    }

    /// Marks every `Active` challenge past `end_at` as `Completed` and
    /// enqueues its settlement.
    fn scan_ended_challenges(&self, now: DateTime<Utc>) -> CoreResult<()> {
        for challenge in self.registry.all()? {
            if challenge.status == ChallengeStatus::Active && challenge.end_at <= now {
                self.registry.mark_completed(&challenge.id)?;
                self.enqueue(challenge.id, now)?;
                tracing::info!(
                    challenge_id = %challenge.id,
                    "challenge ended, settlement enqueued"
                );
            }
        }
        Ok(())
    }

    /// Settles every job whose due instant has passed.
    async fn drain_due_jobs(&self, now: DateTime<Utc>) -> usize {
        let upper = queue_key(now, &Uuid::max());
        let due: Vec<(sled::IVec, sled::IVec)> = self
            .queue
            .range(..=&upper[..])
            .filter_map(|item| item.ok())
            .collect();

        let mut settled = 0;
        for (key, value) in due {
            let raw: [u8; 16] = match value.as_ref().try_into() {
                Ok(raw) => raw,
                Err(_) => {
                    tracing::error!("malformed settlement job value, dropping");
                    let _ = self.queue.remove(&key);
                    continue;
                }
            };
            let challenge_id = Uuid::from_bytes(raw);

            match tokio::time::timeout(SETTLEMENT_JOB_TIMEOUT, self.settlement.settle(challenge_id))
                .await
            {
                Ok(Ok(outcome)) => {
                    settled += 1;
                    self.metrics.settlements_total.inc();
                    if outcome.platform_revenue > 0 {
                        self.metrics
                            .forfeited_tokens_total
                            .inc_by(outcome.platform_revenue);
                    }
                    let _ = self.queue.remove(&key);
                }
                // The challenge can no longer be settled — cancelled by
                // an operator, or gone. The job is dead, not retriable.
                Ok(Err(CoreError::StateConflict { detail })) => {
                    tracing::warn!(
                        challenge_id = %challenge_id,
                        detail,
                        "settlement job dropped"
                    );
                    let _ = self.queue.remove(&key);
                }
                Ok(Err(CoreError::NotFound { .. })) => {
                    tracing::warn!(challenge_id = %challenge_id, "challenge gone, job dropped");
                    let _ = self.queue.remove(&key);
                }
                // Transient: re-enqueue with a delay.
                Ok(Err(e)) => {
                    tracing::error!(challenge_id = %challenge_id, error = %e, "settlement failed, retrying later");
                    self.requeue(&key, challenge_id, now);
                }
                Err(_) => {
                    tracing::error!(challenge_id = %challenge_id, "settlement job timed out, retrying later");
                    self.requeue(&key, challenge_id, now);
                }
            }
        }
        settled
    }

    fn requeue(&self, old_key: &sled::IVec, challenge_id: Uuid, now: DateTime<Utc>) {
        let retry_at = now
            + ChronoDuration::from_std(SETTLEMENT_RETRY_DELAY)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let _ = self.queue.remove(old_key);
        if let Err(e) = self.enqueue(challenge_id, retry_at) {
            tracing::error!(challenge_id = %challenge_id, error = %e, "failed to re-enqueue settlement");
        }
    }

    /// Runs the worker until the shutdown signal flips.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        tracing::info!("settlement worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("settlement worker stopped");
    }
}
