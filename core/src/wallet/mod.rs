//! Per-user wallet operations.
//!
//! Every balance mutation for a user runs under that user's exclusive
//! advisory lock, writes the ledger and the allocation index together,
//! and keeps `balance == Σ allocation.remaining` true at every commit.

pub mod allocation;
pub mod locks;
#[allow(clippy::module_inception)]
pub mod wallet;

pub use allocation::Allocation;
pub use locks::{WalletGuard, WalletLocks};
pub use wallet::{CreditKind, DebitKind, Wallet};
