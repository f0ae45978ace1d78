//! Transaction sequencer
//!
//! Single intake point for committed transactions. Committers add to the
//! open batch; the batch is cut when it reaches the configured byte or
//! commit count, and cut batches queue until the sender takes them.
//!
//! # Backpressure
//!
//! `add_transaction` blocks while `max_pending_batches` cut batches are
//! waiting for the sender. The sender only takes batches while the
//! manager's outstanding ceiling allows, so a saturated wire stalls
//! committers here until an earlier batch is acknowledged.
//!
//! # Lock Ordering
//!
//! The sequencer mutex may be held while taking the [`LockAccounting`]
//! mutex (lock interest is registered before the batch can be handed off).
//! Nothing else is acquired under the sequencer mutex, and no caller holds
//! another pipeline lock while waiting here.

use crate::batch::{FoldDecision, SealedBatch, TransactionBatch};
use crate::sequence::{BatchIdGenerator, SequenceGenerator, TransactionIdGenerator};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use txnpipe_concurrency::LockAccounting;
use txnpipe_core::{
    ClientTransaction, FoldingConfig, LockId, PipelineConfig, SequenceId, TxnError, TxnResult,
};

struct SequencerState {
    current: TransactionBatch,
    pending: VecDeque<SealedBatch>,
    /// One-shot request for the waiting sender to return
    woken: bool,
    shut_down: bool,
}

/// Folds and batches committed transactions
pub struct TransactionSequencer {
    state: Mutex<SequencerState>,
    /// Signalled when a pending batch is taken
    space_available: Condvar,
    /// Signalled when a batch becomes available to the sender
    batch_ready: Condvar,
    lock_accounting: Arc<LockAccounting>,
    sequences: SequenceGenerator,
    txn_ids: TransactionIdGenerator,
    batch_ids: BatchIdGenerator,
    folding: FoldingConfig,
    max_pending_batches: usize,
    max_batch_size_bytes: usize,
    max_transactions_per_batch: usize,
}

impl TransactionSequencer {
    /// Create a sequencer registering lock interest with `lock_accounting`
    pub fn new(config: &PipelineConfig, lock_accounting: Arc<LockAccounting>) -> Self {
        let batch_ids = BatchIdGenerator::new();
        let current = TransactionBatch::new(batch_ids.next_id(), config.folding.clone());
        Self {
            state: Mutex::new(SequencerState {
                current,
                pending: VecDeque::new(),
                woken: false,
                shut_down: false,
            }),
            space_available: Condvar::new(),
            batch_ready: Condvar::new(),
            lock_accounting,
            sequences: SequenceGenerator::new(),
            txn_ids: TransactionIdGenerator::new(),
            batch_ids,
            folding: config.folding.clone(),
            max_pending_batches: config.max_pending_batches.max(1),
            max_batch_size_bytes: config.max_batch_size_bytes,
            max_transactions_per_batch: config.max_transactions_per_batch,
        }
    }

    /// Add a committed transaction.
    ///
    /// Blocks while the pending queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`TxnError::NotRunning`] once the sequencer is shut down,
    /// including for callers blocked on backpressure at that moment.
    pub fn add_transaction(&self, txn: ClientTransaction) -> TxnResult<FoldDecision> {
        let mut state = self.state.lock();
        while state.pending.len() >= self.max_pending_batches && !state.shut_down {
            trace!(target: "txnpipe::txn", pending = state.pending.len(), "Commit blocked on backpressure");
            self.space_available.wait(&mut state);
        }
        if state.shut_down {
            return Err(TxnError::NotRunning);
        }

        let locks: SmallVec<[LockId; 2]> = txn.lock_ids().iter().cloned().collect();
        let decision = state
            .current
            .add_transaction(txn, &self.sequences, &self.txn_ids);
        self.lock_accounting.add(decision.txn_id(), &locks);

        if self.is_full(&state.current) {
            let sealed = self.cut(&mut state);
            state.pending.push_back(sealed);
        }
        self.batch_ready.notify_one();
        Ok(decision)
    }

    fn is_full(&self, batch: &TransactionBatch) -> bool {
        batch.byte_size() >= self.max_batch_size_bytes
            || (self.max_transactions_per_batch > 0
                && batch.number_of_txns_before_folding() >= self.max_transactions_per_batch)
    }

    fn cut(&self, state: &mut SequencerState) -> SealedBatch {
        let next = TransactionBatch::new(self.batch_ids.next_id(), self.folding.clone());
        let full = std::mem::replace(&mut state.current, next);
        debug!(
            target: "txnpipe::batch",
            batch_id = %full.batch_id(),
            before_folding = full.number_of_txns_before_folding(),
            after_folding = full.number_of_txns_after_folding(),
            byte_size = full.byte_size(),
            "Batch closed"
        );
        full.seal()
    }

    fn take(&self, state: &mut SequencerState) -> Option<SealedBatch> {
        if let Some(batch) = state.pending.pop_front() {
            self.space_available.notify_all();
            return Some(batch);
        }
        if state.current.is_empty() {
            return None;
        }
        Some(self.cut(state))
    }

    /// Oldest cut batch, else the open batch if it holds anything.
    ///
    /// Never blocks.
    pub fn next_batch(&self) -> Option<SealedBatch> {
        let mut state = self.state.lock();
        self.take(&mut state)
    }

    /// Like [`next_batch`](Self::next_batch), waiting up to `timeout` for
    /// work. Returns `None` on timeout, after [`wake`](Self::wake), or once
    /// shut down.
    pub fn wait_next_batch(&self, timeout: Duration) -> Option<SealedBatch> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return None;
            }
            if std::mem::take(&mut state.woken) {
                return None;
            }
            if let Some(batch) = self.take(&mut state) {
                return Some(batch);
            }
            if self.batch_ready.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Make the sender's current or next wait return early
    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.batch_ready.notify_all();
    }

    /// Refuse further commits and release every waiter
    pub fn shutdown(&self) {
        self.state.lock().shut_down = true;
        self.space_available.notify_all();
        self.batch_ready.notify_all();
    }

    /// Drop the open batch and everything pending
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.current = TransactionBatch::new(self.batch_ids.next_id(), self.folding.clone());
        self.space_available.notify_all();
    }

    /// Smallest sequence id not yet handed to the sender
    pub fn next_sequence_id(&self) -> SequenceId {
        let state = self.state.lock();
        state
            .pending
            .front()
            .and_then(|batch| batch.min_sequence_id())
            .or_else(|| state.current.min_sequence_id())
            .unwrap_or_else(|| self.sequences.peek())
    }

    /// Number of cut batches waiting for the sender
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Pending queue ceiling
    pub fn max_pending_size(&self) -> usize {
        self.max_pending_batches
    }

    /// True if nothing is pending and the open batch is empty
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.current.is_empty()
    }
}

impl fmt::Debug for TransactionSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionSequencer")
            .field("current", &state.current)
            .field("pending", &state.pending.len())
            .field("max_pending", &self.max_pending_batches)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
