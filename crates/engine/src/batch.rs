//! Transaction batches and commit folding
//!
//! A [`TransactionBatch`] is the open, mutable send unit the sequencer fills.
//! Sealing it yields a [`SealedBatch`]: immutable, cheaply cloneable, and the
//! exact value sent on first transmission and on every resend.
//!
//! # Folding
//!
//! Consecutive commits touching the same objects can share one wire
//! transaction. Each entry owns a folding key: the set of objects it wrote
//! and its [`TxnType`]. An incoming commit is looked up by its pre-existing
//! objects (new objects cannot have been written by an earlier entry):
//!
//! - no keyed object: new entry
//! - every keyed object maps to the same open key of the same type: fold
//! - objects map to more than one key: every such key is closed, new entry
//!
//! Commits creating roots, issuing notifies, or exceeding the configured
//! lock/object limits never fold; they close and forget every key sharing an
//! object with them. A fold adds the commit's locks and changes to the entry
//! and reuses its TransactionId and SequenceId.

use crate::sequence::{SequenceGenerator, TransactionIdGenerator};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use txnpipe_core::{
    ClientTransaction, FoldingConfig, LockId, ObjectChange, ObjectId, SequenceId, TransactionId,
    TxnBatchId, TxnType,
};

/// Outcome of adding a commit to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldDecision {
    /// The commit became a new wire transaction
    NewEntry {
        /// Freshly assigned transaction id
        txn_id: TransactionId,
        /// Freshly assigned sequence id
        sequence_id: SequenceId,
    },
    /// The commit was merged into an existing wire transaction
    FoldedInto {
        /// Id of the entry the commit joined
        txn_id: TransactionId,
        /// Sequence id of that entry
        sequence_id: SequenceId,
    },
}

impl FoldDecision {
    /// Wire transaction carrying the commit
    pub fn txn_id(&self) -> TransactionId {
        match self {
            FoldDecision::NewEntry { txn_id, .. } | FoldDecision::FoldedInto { txn_id, .. } => {
                *txn_id
            }
        }
    }

    /// Sequence id of the wire transaction
    pub fn sequence_id(&self) -> SequenceId {
        match self {
            FoldDecision::NewEntry { sequence_id, .. }
            | FoldDecision::FoldedInto { sequence_id, .. } => *sequence_id,
        }
    }

    /// True if the commit joined an existing entry
    pub fn is_folded(&self) -> bool {
        matches!(self, FoldDecision::FoldedInto { .. })
    }
}

/// One wire transaction: a commit plus every commit folded into it
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    txn_id: TransactionId,
    sequence_id: SequenceId,
    txn_type: TxnType,
    lock_ids: SmallVec<[LockId; 2]>,
    changes: Vec<(ObjectId, ObjectChange)>,
    new_roots: Vec<String>,
    notifies: usize,
    commit_count: usize,
}

impl TransactionEntry {
    fn new(txn_id: TransactionId, sequence_id: SequenceId, txn: ClientTransaction) -> Self {
        let new_roots = txn.new_roots().to_vec();
        let notifies = txn.notify_count();
        let (txn_type, lock_ids, changes) = txn.into_parts();
        Self {
            txn_id,
            sequence_id,
            txn_type,
            lock_ids,
            changes,
            new_roots,
            notifies,
            commit_count: 1,
        }
    }

    fn merge(&mut self, txn: ClientTransaction) {
        self.new_roots.extend(txn.new_roots().iter().cloned());
        self.notifies += txn.notify_count();
        let (_, lock_ids, changes) = txn.into_parts();
        for lock in lock_ids {
            if !self.lock_ids.contains(&lock) {
                self.lock_ids.push(lock);
            }
        }
        for (oid, change) in changes {
            match self.changes.iter_mut().find(|(id, _)| *id == oid) {
                Some((_, existing)) => {
                    existing.is_new |= change.is_new;
                    existing.payload.extend_from_slice(&change.payload);
                }
                None => self.changes.push((oid, change)),
            }
        }
        self.commit_count += 1;
    }

    /// Wire transaction id
    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    /// Sequence id assigned when the entry was created
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Kind shared by every folded commit
    pub fn txn_type(&self) -> TxnType {
        self.txn_type
    }

    /// Union of the locks of every folded commit
    pub fn lock_ids(&self) -> &[LockId] {
        &self.lock_ids
    }

    /// Merged object changes
    pub fn changes(&self) -> &[(ObjectId, ObjectChange)] {
        &self.changes
    }

    /// Roots created
    pub fn new_roots(&self) -> &[String] {
        &self.new_roots
    }

    /// Notifies issued
    pub fn notify_count(&self) -> usize {
        self.notifies
    }

    /// Number of commits carried by this entry
    pub fn commit_count(&self) -> usize {
        self.commit_count
    }
}

struct FoldingKey {
    entry: usize,
    txn_type: TxnType,
    object_ids: FxHashSet<ObjectId>,
    closed: bool,
}

/// Open batch being filled by the sequencer
pub struct TransactionBatch {
    batch_id: TxnBatchId,
    folding: FoldingConfig,
    entries: Vec<TransactionEntry>,
    keys: Vec<FoldingKey>,
    key_by_object: FxHashMap<ObjectId, usize>,
    txns_before_folding: usize,
    byte_size: usize,
    contains_sync_write: bool,
}

impl TransactionBatch {
    /// Create an empty batch
    pub fn new(batch_id: TxnBatchId, folding: FoldingConfig) -> Self {
        Self {
            batch_id,
            folding,
            entries: Vec::new(),
            keys: Vec::new(),
            key_by_object: FxHashMap::default(),
            txns_before_folding: 0,
            byte_size: 0,
            contains_sync_write: false,
        }
    }

    /// Batch id
    pub fn batch_id(&self) -> TxnBatchId {
        self.batch_id
    }

    /// Add a commit, folding it into an existing entry when allowed.
    ///
    /// Ids are drawn from the generators only when a new entry is created.
    pub fn add_transaction(
        &mut self,
        mut txn: ClientTransaction,
        sequences: &SequenceGenerator,
        txn_ids: &TransactionIdGenerator,
    ) -> FoldDecision {
        self.txns_before_folding += 1;
        if txn.txn_type() == TxnType::SyncWrite {
            self.contains_sync_write = true;
        }
        txn.remove_empty_deltas();
        self.byte_size += txn.byte_size();

        if !self.folding.enabled {
            return self.push_entry(txn, sequences, txn_ids, false);
        }

        if let Some(key_idx) = self.find_fold_target(&txn) {
            let key = &mut self.keys[key_idx];
            let oids: Vec<ObjectId> = txn.object_ids().collect();
            key.object_ids.extend(oids.iter().copied());
            let entry = &mut self.entries[key.entry];
            entry.merge(txn);
            for oid in oids {
                self.key_by_object.insert(oid, key_idx);
            }
            if self.folding.debug {
                debug!(
                    target: "txnpipe::batch",
                    batch_id = %self.batch_id,
                    txn_id = %entry.txn_id,
                    commits = entry.commit_count,
                    "Folded commit"
                );
            }
            return FoldDecision::FoldedInto {
                txn_id: entry.txn_id,
                sequence_id: entry.sequence_id,
            };
        }

        self.push_entry(txn, sequences, txn_ids, true)
    }

    /// Folding key to merge `txn` into, closing keys as a side effect
    fn find_fold_target(&mut self, txn: &ClientTransaction) -> Option<usize> {
        let exceeds_limits = exceeds_limit(self.folding.lock_limit, txn.lock_ids().len())
            || exceeds_limit(self.folding.object_limit, txn.changes().len());
        let unfoldable = exceeds_limits || !txn.new_roots().is_empty() || txn.notify_count() > 0;

        if self.folding.debug {
            debug!(
                target: "txnpipe::batch",
                batch_id = %self.batch_id,
                txn_type = %txn.txn_type(),
                locks = txn.lock_ids().len(),
                objects = txn.changes().len(),
                exceeds_limits,
                unfoldable,
                "Incoming commit"
            );
        }

        if unfoldable {
            self.close_keys_sharing_objects(txn);
            return None;
        }

        let mut candidates: SmallVec<[usize; 4]> = SmallVec::new();
        for (oid, change) in txn.changes() {
            if change.is_new {
                continue;
            }
            if let Some(&key_idx) = self.key_by_object.get(oid) {
                if !candidates.contains(&key_idx) {
                    candidates.push(key_idx);
                }
            }
        }

        match candidates.as_slice() {
            [] => None,
            [only] => {
                let key = &self.keys[*only];
                if key.closed || key.txn_type != txn.txn_type() {
                    if self.folding.debug {
                        debug!(target: "txnpipe::batch", batch_id = %self.batch_id, "Fold denied");
                    }
                    None
                } else {
                    Some(*only)
                }
            }
            many => {
                for key_idx in many {
                    self.keys[*key_idx].closed = true;
                }
                if self.folding.debug {
                    debug!(
                        target: "txnpipe::batch",
                        batch_id = %self.batch_id,
                        closed = many.len(),
                        "Dependency across folding keys"
                    );
                }
                None
            }
        }
    }

    fn close_keys_sharing_objects(&mut self, txn: &ClientTransaction) {
        let keys = &mut self.keys;
        self.key_by_object.retain(|_, key_idx| {
            let key = &mut keys[*key_idx];
            if key.closed || txn.object_ids().any(|oid| key.object_ids.contains(&oid)) {
                key.closed = true;
                false
            } else {
                true
            }
        });
    }

    fn push_entry(
        &mut self,
        txn: ClientTransaction,
        sequences: &SequenceGenerator,
        txn_ids: &TransactionIdGenerator,
        register_key: bool,
    ) -> FoldDecision {
        let sequence_id = sequences.next_id();
        let txn_id = txn_ids.next_id();
        let entry_idx = self.entries.len();

        if register_key {
            let key_idx = self.keys.len();
            let object_ids: FxHashSet<ObjectId> = txn.object_ids().collect();
            for oid in &object_ids {
                self.key_by_object.insert(*oid, key_idx);
            }
            self.keys.push(FoldingKey {
                entry: entry_idx,
                txn_type: txn.txn_type(),
                object_ids,
                closed: false,
            });
        }

        self.entries
            .push(TransactionEntry::new(txn_id, sequence_id, txn));
        FoldDecision::NewEntry {
            txn_id,
            sequence_id,
        }
    }

    /// Estimated encoded size of everything added so far
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Commits added, counting each folded commit
    pub fn number_of_txns_before_folding(&self) -> usize {
        self.txns_before_folding
    }

    /// Wire transactions in the batch
    pub fn number_of_txns_after_folding(&self) -> usize {
        self.entries.len()
    }

    /// True if no commit has been added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest sequence id in the batch
    pub fn min_sequence_id(&self) -> Option<SequenceId> {
        self.entries.iter().map(|e| e.sequence_id).min()
    }

    /// Freeze the batch for sending
    pub fn seal(self) -> SealedBatch {
        SealedBatch {
            inner: Arc::new(SealedInner {
                batch_id: self.batch_id,
                entries: self.entries,
                txns_before_folding: self.txns_before_folding,
                byte_size: self.byte_size,
                contains_sync_write: self.contains_sync_write,
            }),
        }
    }
}

impl fmt::Debug for TransactionBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBatch")
            .field("batch_id", &self.batch_id)
            .field("before_folding", &self.txns_before_folding)
            .field("after_folding", &self.entries.len())
            .field("byte_size", &self.byte_size)
            .field("folding_keys", &self.keys.iter().filter(|k| !k.closed).count())
            .finish()
    }
}

fn exceeds_limit(limit: usize, value: usize) -> bool {
    limit > 0 && value > limit
}

struct SealedInner {
    batch_id: TxnBatchId,
    entries: Vec<TransactionEntry>,
    txns_before_folding: usize,
    byte_size: usize,
    contains_sync_write: bool,
}

/// Immutable batch, shared between the in-flight and resend paths
#[derive(Clone)]
pub struct SealedBatch {
    inner: Arc<SealedInner>,
}

impl SealedBatch {
    /// Batch id
    pub fn batch_id(&self) -> TxnBatchId {
        self.inner.batch_id
    }

    /// Wire transaction ids in batch order
    pub fn transaction_ids(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.inner.entries.iter().map(|e| e.txn_id)
    }

    /// Sequence ids in batch order
    pub fn sequence_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.inner.entries.iter().map(|e| e.sequence_id)
    }

    /// Smallest sequence id, `None` for an empty batch
    pub fn min_sequence_id(&self) -> Option<SequenceId> {
        self.sequence_ids().min()
    }

    /// Wire transactions in batch order
    pub fn entries(&self) -> &[TransactionEntry] {
        &self.inner.entries
    }

    /// Entry for one transaction id
    pub fn entry(&self, txn_id: TransactionId) -> Option<&TransactionEntry> {
        self.inner.entries.iter().find(|e| e.txn_id == txn_id)
    }

    /// True if any folded commit was a sync-write
    pub fn contains_sync_write(&self) -> bool {
        self.inner.contains_sync_write
    }

    /// Ids of the sync-write entries
    pub fn sync_write_transaction_ids(&self) -> Vec<TransactionId> {
        self.inner
            .entries
            .iter()
            .filter(|e| e.txn_type == TxnType::SyncWrite)
            .map(|e| e.txn_id)
            .collect()
    }

    /// Estimated encoded size
    pub fn byte_size(&self) -> usize {
        self.inner.byte_size
    }

    /// Commits carried, counting each folded commit
    pub fn number_of_txns_before_folding(&self) -> usize {
        self.inner.txns_before_folding
    }

    /// Wire transactions carried
    pub fn number_of_txns_after_folding(&self) -> usize {
        self.inner.entries.len()
    }

    /// True if both values share the same content
    pub fn ptr_eq(&self, other: &SealedBatch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SealedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<u64> = self.transaction_ids().map(|id| id.as_u64()).collect();
        f.debug_struct("SealedBatch")
            .field("batch_id", &self.inner.batch_id)
            .field("transaction_ids", &ids)
            .field("before_folding", &self.inner.txns_before_folding)
            .field("byte_size", &self.inner.byte_size)
            .finish()
    }
}
