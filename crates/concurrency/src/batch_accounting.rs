//! Per-batch acknowledgment accounting
//!
//! Tracks, for every batch handed to the channel, which of its transactions
//! are still unacknowledged. From that it derives:
//! - batch completion (the ack that empties a batch returns its id),
//! - the FIFO order of incomplete batches, which is the resend order after a
//!   reconnect,
//! - the completed-transaction low-water mark reported to the server.
//!
//! Incomplete batches keep their registration order. Acknowledgment activity
//! only removes batches from that order, it never reorders it.
//!
//! All state sits behind one mutex. Reads for reporting (`Debug`, `Display`,
//! the `add_*_to` snapshots) take the same mutex as mutation.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};
use txnpipe_core::{TransactionId, TxnBatchId};

struct BatchRecord {
    /// Registration position, key into `incomplete`
    position: u64,
    all: Vec<TransactionId>,
    remaining: FxHashSet<TransactionId>,
}

#[derive(Default)]
struct BatchState {
    next_position: u64,
    /// Registration position -> batch, oldest first
    incomplete: BTreeMap<u64, TxnBatchId>,
    batches: FxHashMap<TxnBatchId, BatchRecord>,
    /// Every unacknowledged transaction and the batch holding it
    outstanding: BTreeMap<TransactionId, TxnBatchId>,
    /// Transactions of completed batches not yet reported onward
    completed: BTreeSet<TransactionId>,
    high_water_mark: Option<TransactionId>,
    stopped: bool,
}

/// Batch -> remaining-transactions bookkeeping
#[derive(Default)]
pub struct BatchAccounting {
    state: Mutex<BatchState>,
}

impl BatchAccounting {
    /// Create empty accounting
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch at the tail of the incomplete sequence.
    ///
    /// A batch with no transactions has nothing to wait for and is not
    /// recorded as incomplete. Registering an id twice, or a transaction that
    /// already belongs to another batch, is logged and ignored.
    pub fn add_batch<I>(&self, batch_id: TxnBatchId, transaction_ids: I)
    where
        I: IntoIterator<Item = TransactionId>,
    {
        let mut state = self.state.lock();
        if state.stopped {
            debug!(target: "txnpipe::batch", batch_id = %batch_id, "Ignoring batch added after stop");
            return;
        }
        if state.batches.contains_key(&batch_id) {
            warn!(target: "txnpipe::batch", batch_id = %batch_id, "Batch already registered");
            return;
        }

        let mut all = Vec::new();
        let mut remaining = FxHashSet::default();
        for txn_id in transaction_ids {
            if let Some(owner) = state.outstanding.get(&txn_id) {
                warn!(
                    target: "txnpipe::batch",
                    txn_id = %txn_id,
                    owner = %owner,
                    batch_id = %batch_id,
                    "Transaction already belongs to another batch"
                );
                continue;
            }
            if remaining.insert(txn_id) {
                all.push(txn_id);
            }
        }

        if all.is_empty() {
            debug!(target: "txnpipe::batch", batch_id = %batch_id, "Empty batch has no outstanding work");
            return;
        }

        for txn_id in &all {
            state.outstanding.insert(*txn_id, batch_id);
            if state.high_water_mark.map_or(true, |hwm| *txn_id > hwm) {
                state.high_water_mark = Some(*txn_id);
            }
        }

        let position = state.next_position;
        state.next_position += 1;
        state.incomplete.insert(position, batch_id);
        state.batches.insert(
            batch_id,
            BatchRecord {
                position,
                all,
                remaining,
            },
        );
    }

    /// Acknowledge one transaction.
    ///
    /// Returns the batch id if this acknowledgment completed its batch,
    /// `None` otherwise. Unknown and already-acknowledged ids are no-ops.
    pub fn acknowledge(&self, txn_id: TransactionId) -> Option<TxnBatchId> {
        let mut state = self.state.lock();
        let batch_id = state.outstanding.remove(&txn_id)?;

        let now_empty = match state.batches.get_mut(&batch_id) {
            Some(record) => {
                record.remaining.remove(&txn_id);
                record.remaining.is_empty()
            }
            None => false,
        };
        if !now_empty {
            return None;
        }

        let record = state.batches.remove(&batch_id)?;
        state.incomplete.remove(&record.position);
        state.completed.extend(record.all);
        Some(batch_id)
    }

    /// Batch holding an unacknowledged transaction
    pub fn batch_for_transaction(&self, txn_id: TransactionId) -> Option<TxnBatchId> {
        self.state.lock().outstanding.get(&txn_id).copied()
    }

    /// Oldest incomplete batch, the resend-order anchor
    pub fn min_incomplete_batch_id(&self) -> Option<TxnBatchId> {
        self.state
            .lock()
            .incomplete
            .values()
            .next()
            .copied()
    }

    /// Append incomplete batch ids, oldest first
    pub fn add_incomplete_batch_ids_to<'a>(
        &self,
        dst: &'a mut Vec<TxnBatchId>,
    ) -> &'a mut Vec<TxnBatchId> {
        let state = self.state.lock();
        dst.extend(state.incomplete.values().copied());
        dst
    }

    /// Append transactions of completed batches not yet cleared, ascending
    pub fn add_completed_transaction_ids_to<'a>(
        &self,
        dst: &'a mut Vec<TransactionId>,
    ) -> &'a mut Vec<TransactionId> {
        let state = self.state.lock();
        dst.extend(state.completed.iter().copied());
        dst
    }

    /// Forget completed transactions once they have been reported onward
    pub fn clear_completed_transaction_ids(&self) {
        self.state.lock().completed.clear();
    }

    /// Completed-transaction low-water mark.
    ///
    /// Every transaction below the mark is acknowledged: the smallest
    /// outstanding id if any, else one past the highest id ever registered,
    /// else `None` when nothing has been registered yet.
    pub fn low_water_mark(&self) -> Option<TransactionId> {
        let state = self.state.lock();
        match state.outstanding.keys().next() {
            Some(min) => Some(*min),
            None => state.high_water_mark.map(|hwm| hwm.next()),
        }
    }

    /// Number of incomplete batches
    pub fn incomplete_len(&self) -> usize {
        self.state.lock().incomplete.len()
    }

    /// Number of unacknowledged transactions
    pub fn outstanding_len(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// True if no batch is incomplete
    pub fn is_empty(&self) -> bool {
        self.state.lock().incomplete.is_empty()
    }

    /// Reset all state, used on manager restart and rejoin
    pub fn clear(&self) {
        *self.state.lock() = BatchState::default();
    }

    /// Reset all state and ignore batches registered afterwards
    pub fn stop(&self) {
        let mut state = self.state.lock();
        *state = BatchState::default();
        state.stopped = true;
    }
}

impl fmt::Display for BatchAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "BatchAccounting[incomplete={}, outstanding txns={}, completed uncleared={}]",
            state.incomplete.len(),
            state.outstanding.len(),
            state.completed.len()
        )
    }
}

impl fmt::Debug for BatchAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let incomplete: Vec<_> = state
            .incomplete
            .values()
            .map(|id| {
                let remaining = state
                    .batches
                    .get(id)
                    .map(|r| r.remaining.len())
                    .unwrap_or_default();
                (*id, remaining)
            })
            .collect();
        f.debug_struct("BatchAccounting")
            .field("incomplete", &incomplete)
            .field("outstanding", &state.outstanding.len())
            .field("completed", &state.completed)
            .field("high_water_mark", &state.high_water_mark)
            .field("stopped", &state.stopped)
            .finish()
    }
}
