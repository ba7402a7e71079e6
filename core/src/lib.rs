//! # Chally Financial Core
//!
//! The money layer of the Chally challenge platform: users buy tokens,
//! stake them on time-bounded challenges, and winners split the forfeited
//! stakes. This crate owns everything that must stay exactly correct
//! while that happens:
//!
//! - **ledger** — append-only record of every token movement. Balances
//!   are projections over entries, never stored scalars.
//! - **wallet** — per-user credit/debit under an exclusive advisory lock,
//!   with FIFO deposit lots so refunds find their way back to the
//!   originating charge.
//! - **deposit** — checkout-session creation and idempotent webhook
//!   ingestion against the payment processor.
//! - **withdraw** — FIFO refund allocation with partial-success
//!   semantics when the processor rejects individual charges.
//! - **processor** — the external payment-processor contract, its Stripe
//!   implementation, webhook signature verification, and a scriptable
//!   mock.
//! - **storage** — sled-backed persistence with key layouts chosen so
//!   the orders the engines need are prefix scans.
//! - **config** — constants and environment-resolved settings.
//!
//! ## Design Rules
//!
//! 1. All amounts are integer tokens (minor units). No floats touch
//!    money, anywhere, ever.
//! 2. Every reaction to an external event is idempotent — webhook
//!    retries and job replays must collapse into one movement.
//! 3. All validation happens before the first storage write; a failed
//!    operation leaves no partial rows.
//! 4. One user lock per single-user operation; multi-user operations
//!    acquire in ascending user-id order. That is the entire deadlock
//!    story, and it stays that simple on purpose.

pub mod config;
pub mod deposit;
pub mod error;
pub mod ledger;
pub mod processor;
pub mod storage;
pub mod wallet;
pub mod withdraw;
