//! Committed units of work
//!
//! A [`ClientTransaction`] is what the application layer hands to the
//! pipeline on commit: the locks it was made under, the kind of transaction
//! and the captured object changes. The payload bytes are opaque here; only
//! their size and object identity matter for batching and folding.

use crate::ids::{LockId, ObjectId};
use smallvec::SmallVec;
use std::fmt;

/// Fixed per-change overhead used by the batch size estimate
pub const CHANGE_OVERHEAD_BYTES: usize = 16;

/// Fixed per-transaction overhead used by the batch size estimate
pub const TXN_OVERHEAD_BYTES: usize = 32;

/// Kind of transaction, derived from the lock level it was committed under
///
/// Only transactions of the same kind can fold into one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TxnType {
    /// Ordinary write under a write lock
    #[default]
    Normal,
    /// Write under a concurrent lock
    Concurrent,
    /// Write whose lock release waits for server receipt
    SyncWrite,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnType::Normal => write!(f, "NORMAL"),
            TxnType::Concurrent => write!(f, "CONCURRENT"),
            TxnType::SyncWrite => write!(f, "SYNC_WRITE"),
        }
    }
}

/// Captured change to one clustered object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    /// Object created inside this transaction
    pub is_new: bool,
    /// Encoded delta, opaque to the pipeline
    pub payload: Vec<u8>,
}

impl ObjectChange {
    /// True when the change carries nothing for a pre-existing object
    pub fn is_empty_delta(&self) -> bool {
        !self.is_new && self.payload.is_empty()
    }
}

/// One committed unit of work
#[derive(Debug, Clone, Default)]
pub struct ClientTransaction {
    txn_type: TxnType,
    lock_ids: SmallVec<[LockId; 2]>,
    changes: Vec<(ObjectId, ObjectChange)>,
    new_roots: Vec<String>,
    notifies: usize,
}

impl ClientTransaction {
    /// Create an empty transaction of the given kind
    pub fn new(txn_type: TxnType) -> Self {
        Self {
            txn_type,
            ..Default::default()
        }
    }

    /// Add a lock the transaction was committed under
    pub fn with_lock(mut self, lock: impl Into<LockId>) -> Self {
        let lock = lock.into();
        if !self.lock_ids.contains(&lock) {
            self.lock_ids.push(lock);
        }
        self
    }

    /// Record a change to a pre-existing object
    pub fn with_change(mut self, oid: ObjectId, payload: impl Into<Vec<u8>>) -> Self {
        self.record(oid, false, payload.into());
        self
    }

    /// Record creation of a new object
    pub fn with_new_object(mut self, oid: ObjectId, payload: impl Into<Vec<u8>>) -> Self {
        self.record(oid, true, payload.into());
        self
    }

    /// Record a new root created by this transaction
    pub fn with_root(mut self, name: impl Into<String>) -> Self {
        self.new_roots.push(name.into());
        self
    }

    /// Record a notify/notifyAll issued under the lock
    pub fn with_notify(mut self) -> Self {
        self.notifies += 1;
        self
    }

    fn record(&mut self, oid: ObjectId, is_new: bool, payload: Vec<u8>) {
        match self.changes.iter_mut().find(|(id, _)| *id == oid) {
            Some((_, change)) => {
                change.is_new |= is_new;
                change.payload.extend_from_slice(&payload);
            }
            None => self.changes.push((oid, ObjectChange { is_new, payload })),
        }
    }

    /// Kind of transaction
    pub fn txn_type(&self) -> TxnType {
        self.txn_type
    }

    /// Locks the transaction was committed under
    pub fn lock_ids(&self) -> &[LockId] {
        &self.lock_ids
    }

    /// Object changes in commit order
    pub fn changes(&self) -> &[(ObjectId, ObjectChange)] {
        &self.changes
    }

    /// Ids of all changed objects
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.changes.iter().map(|(oid, _)| *oid)
    }

    /// New roots created by the transaction
    pub fn new_roots(&self) -> &[String] {
        &self.new_roots
    }

    /// Number of notifies issued
    pub fn notify_count(&self) -> usize {
        self.notifies
    }

    /// True if there is anything to send
    pub fn has_changes_or_notifies(&self) -> bool {
        !self.changes.is_empty() || self.notifies > 0 || !self.new_roots.is_empty()
    }

    /// Drop deltas on pre-existing objects that carry no data
    pub fn remove_empty_deltas(&mut self) {
        self.changes.retain(|(_, change)| !change.is_empty_delta());
    }

    /// Decompose into locks and changes for merging into a batch entry
    pub fn into_parts(self) -> (TxnType, SmallVec<[LockId; 2]>, Vec<(ObjectId, ObjectChange)>) {
        (self.txn_type, self.lock_ids, self.changes)
    }

    /// Estimated encoded size
    pub fn byte_size(&self) -> usize {
        let changes: usize = self
            .changes
            .iter()
            .map(|(_, c)| c.payload.len() + CHANGE_OVERHEAD_BYTES)
            .sum();
        let roots: usize = self.new_roots.iter().map(|r| r.len()).sum();
        TXN_OVERHEAD_BYTES + changes + roots + self.notifies * CHANGE_OVERHEAD_BYTES
    }
}
