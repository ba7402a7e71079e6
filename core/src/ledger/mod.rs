//! Append-only token ledger.
//!
//! The single source of truth for every token movement. Balances are
//! projections over entries, never stored scalars.

pub mod book;
pub mod entry;

pub use book::Ledger;
pub use entry::{EntryKind, LedgerEntry};
