//! # CoreDb — Persistent Storage Engine
//!
//! The persistence layer for the financial core, built on sled's embedded
//! key-value store. All on-disk money flows through this module.
//!
//! ## Tree Layout
//!
//! sled organizes data into named "trees", each an independent B+ tree
//! with its own keyspace:
//!
//! | Tree              | Key                                   | Value                  |
//! |-------------------|---------------------------------------|------------------------|
//! | `ledger`          | `user_id (16B) ‖ seq (8B BE)`         | `bincode(LedgerEntry)` |
//! | `ledger_external` | `kind (1B) ‖ external_id (UTF-8)`     | ledger key (24B)       |
//! | `allocations`     | `user_id (16B) ‖ seq (8B BE) ‖ id (16B)` | `bincode(Allocation)` |
//! | `refunds`         | `user_id (16B) ‖ refund_id (16B)`     | `bincode(Refund)`      |
//! | `metadata`        | key (UTF-8)                           | value (bytes)          |
//!
//! Sequence numbers are stored big-endian so sled's lexicographic ordering
//! matches numeric ordering — a prefix scan over a user's ledger yields
//! entries in commit order, and a prefix scan over allocations yields lots
//! oldest-first, which is exactly the FIFO order the withdrawal engine
//! consumes them in.
//!
//! The `ledger_external` tree is the idempotency index: one entry per
//! `(kind, external_id)` pair, inserted with compare-and-swap so two
//! concurrent writers racing on the same external reference cannot both
//! win.
//!
//! Higher layers (the challenge registry, the settlement journal, the job
//! queue) open their own trees through [`CoreDb::open_tree`] rather than
//! widening this struct.

use sled::{Db, Tree};
use std::path::Path;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::ledger::entry::{EntryKind, LedgerEntry};
use crate::wallet::allocation::Allocation;
use crate::withdraw::Refund;

/// Well-known key in the `metadata` tree for the global entry sequence.
const META_ENTRY_SEQ: &[u8] = b"entry_seq";

/// Builds the 24-byte ledger key for a user + sequence number.
pub(crate) fn ledger_key(user_id: &Uuid, seq: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(user_id.as_bytes());
    key[16..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Builds the 40-byte allocation key: user, then creation sequence, then id.
fn allocation_key(user_id: &Uuid, seq: u64, id: &Uuid) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..16].copy_from_slice(user_id.as_bytes());
    key[16..24].copy_from_slice(&seq.to_be_bytes());
    key[24..].copy_from_slice(id.as_bytes());
    key
}

/// Builds the external-reference index key: kind discriminant + raw id.
fn external_key(kind: EntryKind, external_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + external_id.len());
    key.push(kind.discriminant());
    key.extend_from_slice(external_id.as_bytes());
    key
}

/// Persistent storage engine for the financial core.
///
/// Wraps a sled `Db` and exposes typed accessors for ledger entries,
/// allocations, and refunds. All serialization uses bincode.
///
/// # Thread Safety
///
/// sled trees support lock-free concurrent reads and serialized writes, so
/// `CoreDb` is shared across tasks via `Arc<CoreDb>` without external
/// synchronization. Logical consistency across trees (ledger + allocations
/// moving together) is the wallet lock's job, not this layer's.
#[derive(Debug)]
pub struct CoreDb {
    /// The underlying sled database handle.
    db: Db,
    /// Append-only ledger entries.
    ledger: Tree,
    /// Idempotency index: `(kind, external_id)` -> ledger key.
    ledger_external: Tree,
    /// FIFO deposit lots, keyed for oldest-first prefix scans.
    allocations: Tree,
    /// Audit records of executed external refunds.
    refunds: Tree,
    /// Global counters and bookkeeping.
    metadata: Tree,
    /// Serializes sequence-number allocation.
    seq_guard: Mutex<()>,
}

impl CoreDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that lives in memory and is cleaned up
    /// when dropped. Ideal for tests — no filesystem side effects.
    pub fn open_temporary() -> CoreResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> CoreResult<Self> {
        let ledger = db.open_tree("ledger")?;
        let ledger_external = db.open_tree("ledger_external")?;
        let allocations = db.open_tree("allocations")?;
        let refunds = db.open_tree("refunds")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            ledger,
            ledger_external,
            allocations,
            refunds,
            metadata,
            seq_guard: Mutex::new(()),
        })
    }

    /// Open a named sled tree from the underlying database.
    ///
    /// Used by the challenge registry, settlement journal, and job queue,
    /// which need dedicated keyspaces in the same database instance.
    pub fn open_tree(&self, name: &str) -> CoreResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> CoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // -- Sequence numbers ----------------------------------------------------

    /// Allocates the next value of the global entry sequence.
    ///
    /// The sequence orders ledger entries and allocations within a user;
    /// across users it carries no meaning beyond uniqueness.
    pub fn next_seq(&self) -> CoreResult<u64> {
        let _guard = self.seq_guard.lock();
        let next = match self.metadata.get(META_ENTRY_SEQ)? {
            Some(bytes) => {
                let current = u64::from_be_bytes(
                    bytes
                        .as_ref()
                        .try_into()
                        .map_err(|_| CoreError::Storage("corrupt sequence counter".into()))?,
                );
                current + 1
            }
            None => 1,
        };
        self.metadata.insert(META_ENTRY_SEQ, &next.to_be_bytes())?;
        Ok(next)
    }

    // -- Ledger operations ---------------------------------------------------

    /// Persists a ledger entry, claiming its external reference first.
    ///
    /// When the entry carries an `external_id`, the `(kind, external_id)`
    /// slot is claimed with compare-and-swap before the entry is written.
    /// If the slot is already taken this returns [`CoreError::Duplicate`]
    /// with the id of the surviving entry and writes nothing.
    pub fn append_ledger_entry(&self, entry: &LedgerEntry) -> CoreResult<()> {
        let key = ledger_key(&entry.user_id, entry.seq);

        if let Some(external_id) = &entry.external_id {
            let ext_key = external_key(entry.kind, external_id);
            let claimed = self.ledger_external.compare_and_swap(
                &ext_key,
                None::<&[u8]>,
                Some(&key[..]),
            )?;
            if claimed.is_err() {
                let existing = self
                    .find_external(entry.kind, external_id)?
                    .ok_or_else(|| CoreError::Storage("dangling external index".into()))?;
                return Err(CoreError::Duplicate {
                    entry_id: existing.id,
                });
            }
        }

        let bytes = bincode::serialize(entry)?;
        self.ledger.insert(key, bytes)?;
        Ok(())
    }

    /// Looks up the ledger entry owning a `(kind, external_id)` pair.
    pub fn find_external(
        &self,
        kind: EntryKind,
        external_id: &str,
    ) -> CoreResult<Option<LedgerEntry>> {
        let ext_key = external_key(kind, external_id);
        match self.ledger_external.get(ext_key)? {
            Some(ledger_key_bytes) => match self.ledger.get(&ledger_key_bytes)? {
                Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Returns every ledger entry for a user in commit (sequence) order.
    pub fn ledger_entries(&self, user_id: &Uuid) -> CoreResult<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for item in self.ledger.scan_prefix(user_id.as_bytes()) {
            let (_key, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Total number of ledger entries across all users. Test support.
    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    // -- Allocation operations -----------------------------------------------

    /// Inserts or overwrites an allocation.
    ///
    /// Allocations are created once per deposit/payout and afterwards only
    /// their `remaining` field moves (downwards), so an overwrite with the
    /// same key is always the intended update.
    pub fn put_allocation(&self, allocation: &Allocation) -> CoreResult<()> {
        let key = allocation_key(&allocation.user_id, allocation.seq, &allocation.id);
        let bytes = bincode::serialize(allocation)?;
        self.allocations.insert(key, bytes)?;
        Ok(())
    }

    /// Returns every allocation for a user, oldest first (FIFO order).
    pub fn allocations(&self, user_id: &Uuid) -> CoreResult<Vec<Allocation>> {
        let mut lots = Vec::new();
        for item in self.allocations.scan_prefix(user_id.as_bytes()) {
            let (_key, value) = item?;
            lots.push(bincode::deserialize(&value)?);
        }
        Ok(lots)
    }

    /// Total number of allocations across all users. Test support.
    pub fn allocation_len(&self) -> usize {
        self.allocations.len()
    }

    // -- Refund operations ---------------------------------------------------

    /// Persists a refund audit record.
    pub fn put_refund(&self, refund: &Refund) -> CoreResult<()> {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(refund.user_id.as_bytes());
        key[16..].copy_from_slice(refund.id.as_bytes());
        let bytes = bincode::serialize(refund)?;
        self.refunds.insert(key, bytes)?;
        Ok(())
    }

    /// Returns every refund executed for a user.
    pub fn refunds(&self, user_id: &Uuid) -> CoreResult<Vec<Refund>> {
        let mut records = Vec::new();
        for item in self.refunds.scan_prefix(user_id.as_bytes()) {
            let (_key, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }
}
