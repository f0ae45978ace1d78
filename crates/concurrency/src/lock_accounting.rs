//! Per-lock acknowledgment accounting
//!
//! Tracks which transactions are still outstanding for every lock, and which
//! locks every transaction declared interest in. A lock holder may hand its
//! lock to another node only once every transaction written under it has
//! been acknowledged; [`LockAccounting::wait_until_lock_flushed`] blocks for
//! exactly that.
//!
//! # Folding
//!
//! When several commits fold into one wire transaction, [`LockAccounting::add`]
//! is called again for the same id. The call is additive: the transaction's
//! lock set grows and no second transaction entry is created.
//!
//! # Waiting
//!
//! Every wait re-checks its condition under the accounting mutex after each
//! wake-up. Waiters are woken when a lock drains, when the whole structure
//! drains, on server receipt of sync-write transactions, and on interruption.
//! An interrupted wait returns [`TxnError::Interrupted`]; it never reports
//! success for a condition that did not hold.

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use txnpipe_core::{LockId, TransactionId, TxnError, TxnResult};

/// Waits longer than this are reported in the log
pub const FLUSH_WAIT_INTERVAL: Duration = Duration::from_secs(15);

/// Spacing between repeated slow-wait reports
const SLOW_WAIT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct TxnLocks {
    locks: FxHashSet<LockId>,
    /// Server has received (not necessarily applied) the transaction
    received: bool,
}

#[derive(Default)]
struct LockState {
    by_lock: FxHashMap<LockId, FxHashSet<TransactionId>>,
    by_txn: FxHashMap<TransactionId, TxnLocks>,
    /// Bumped to cancel every wait in progress
    interrupt_epoch: u64,
    shut_down: bool,
}

impl LockState {
    fn pending_for(&self, lock: &LockId) -> usize {
        self.by_lock.get(lock).map_or(0, |txns| txns.len())
    }
}

/// Lock -> outstanding-transactions bookkeeping
#[derive(Default)]
pub struct LockAccounting {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl LockAccounting {
    /// Create empty accounting
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `txn_id` with every lock in `lock_ids`.
    ///
    /// Re-adding an id extends its lock set; re-adding a lock is a no-op.
    pub fn add(&self, txn_id: TransactionId, lock_ids: &[LockId]) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let entry = state.by_txn.entry(txn_id).or_default();
        for lock in lock_ids {
            if entry.locks.insert(lock.clone()) {
                state
                    .by_lock
                    .entry(lock.clone())
                    .or_default()
                    .insert(txn_id);
            }
        }
    }

    /// Remove an acknowledged transaction.
    ///
    /// Returns exactly the locks whose outstanding set became empty because
    /// of this call. Unknown ids return an empty set.
    pub fn acknowledge(&self, txn_id: TransactionId) -> FxHashSet<LockId> {
        let mut state = self.state.lock();
        let mut vacated = FxHashSet::default();
        let Some(entry) = state.by_txn.remove(&txn_id) else {
            return vacated;
        };

        for lock in entry.locks {
            let now_empty = match state.by_lock.get_mut(&lock) {
                Some(txns) => {
                    txns.remove(&txn_id);
                    txns.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.by_lock.remove(&lock);
                vacated.insert(lock);
            }
        }

        // Receipt waits can be satisfied without any lock vacating
        self.changed.notify_all();
        vacated
    }

    /// Snapshot of the transactions still outstanding for `lock`
    pub fn transactions_for(&self, lock: &LockId) -> FxHashSet<TransactionId> {
        self.state
            .lock()
            .by_lock
            .get(lock)
            .cloned()
            .unwrap_or_default()
    }

    /// True iff no transaction is tracked
    pub fn is_empty(&self) -> bool {
        self.state.lock().by_txn.is_empty()
    }

    /// Number of tracked transactions
    pub fn size_of_transaction_map(&self) -> usize {
        self.state.lock().by_txn.len()
    }

    /// Number of locks with outstanding transactions
    pub fn size_of_lock_map(&self) -> usize {
        self.state.lock().by_lock.len()
    }

    /// Number of distinct (transaction, lock) associations
    pub fn association_count(&self) -> usize {
        self.state
            .lock()
            .by_txn
            .values()
            .map(|entry| entry.locks.len())
            .sum()
    }

    /// Record server receipt of sync-write transactions
    pub fn transactions_received<I>(&self, txn_ids: I)
    where
        I: IntoIterator<Item = TransactionId>,
    {
        let mut state = self.state.lock();
        let mut any = false;
        for txn_id in txn_ids {
            if let Some(entry) = state.by_txn.get_mut(&txn_id) {
                entry.received = true;
                any = true;
            }
        }
        if any {
            self.changed.notify_all();
        }
    }

    /// True if the server has received every outstanding transaction of `lock`
    pub fn are_transactions_received_for(&self, lock: &LockId) -> bool {
        let state = self.state.lock();
        Self::all_received(&state, lock)
    }

    fn all_received(state: &LockState, lock: &LockId) -> bool {
        state.by_lock.get(lock).map_or(true, |txns| {
            txns.iter()
                .all(|id| state.by_txn.get(id).map_or(true, |e| e.received))
        })
    }

    /// Block until every transaction of `lock` is acknowledged.
    ///
    /// Returns at once if nothing is outstanding for the lock.
    pub fn wait_until_lock_flushed(&self, lock: &LockId) -> TxnResult<()> {
        self.wait_until(&format!("Flush for {}", lock), None, |state| {
            match state.pending_for(lock) {
                0 => None,
                n => Some(n),
            }
        })
    }

    /// Block until the server has received every outstanding transaction of `lock`
    pub fn wait_until_received_for(&self, lock: &LockId) -> TxnResult<()> {
        self.wait_until(&format!("Sync write for {}", lock), None, |state| {
            if Self::all_received(state, lock) {
                None
            } else {
                Some(state.pending_for(lock))
            }
        })
    }

    /// Block until no transaction is tracked at all.
    ///
    /// `None` waits without bound. On expiry returns
    /// [`TxnError::DrainTimeout`]; on interruption [`TxnError::Interrupted`].
    pub fn wait_all_current_txn_completed(&self, timeout: Option<Duration>) -> TxnResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.wait_until("Drain of all transactions", deadline, |state| {
            match state.by_txn.len() {
                0 => None,
                n => Some(n),
            }
        })
    }

    /// Cancel every wait currently in progress
    pub fn interrupt_waiters(&self) {
        let mut state = self.state.lock();
        state.interrupt_epoch += 1;
        self.changed.notify_all();
    }

    /// Forget all transactions; waits in progress are interrupted
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.by_lock.clear();
        state.by_txn.clear();
        state.interrupt_epoch += 1;
        self.changed.notify_all();
    }

    /// Refuse to wait from now on; waits in progress fail unless already satisfied
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        self.changed.notify_all();
    }

    /// Shared wait loop.
    ///
    /// `pending` returns `None` once the awaited condition holds, otherwise
    /// the number of transactions still blocking it.
    fn wait_until<F>(&self, what: &str, deadline: Option<Instant>, pending: F) -> TxnResult<()>
    where
        F: Fn(&LockState) -> Option<usize>,
    {
        let start = Instant::now();
        let mut last_report: Option<Instant> = None;
        let mut state: MutexGuard<'_, LockState> = self.state.lock();
        let epoch = state.interrupt_epoch;

        loop {
            if state.interrupt_epoch != epoch {
                debug!(target: "txnpipe::lock", what, "Wait interrupted");
                return Err(TxnError::Interrupted);
            }
            let Some(count) = pending(&*state) else {
                return Ok(());
            };
            if state.shut_down {
                return Err(TxnError::NotRunning);
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(TxnError::DrainTimeout {
                        pending: count,
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }

            let waited = now.duration_since(start);
            if waited > FLUSH_WAIT_INTERVAL
                && last_report.map_or(true, |at| now.duration_since(at) > SLOW_WAIT_REPORT_INTERVAL)
            {
                info!(
                    target: "txnpipe::lock",
                    what,
                    waited_ms = waited.as_millis() as u64,
                    unacked = count,
                    "Wait took longer than {}s",
                    FLUSH_WAIT_INTERVAL.as_secs()
                );
                last_report = Some(now);
            }

            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(now)
                    .min(SLOW_WAIT_REPORT_INTERVAL),
                None => SLOW_WAIT_REPORT_INTERVAL,
            };
            self.changed.wait_for(&mut state, slice);
        }
    }
}

impl fmt::Display for LockAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "LockAccounting[locks={}, txns={}]",
            state.by_lock.len(),
            state.by_txn.len()
        )
    }
}

impl fmt::Debug for LockAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Point-in-time copy so formatting never observes a map mid-update
        let (locks, txns) = {
            let state = self.state.lock();
            let mut locks: Vec<(String, usize)> = state
                .by_lock
                .iter()
                .map(|(lock, txns)| (lock.to_string(), txns.len()))
                .collect();
            locks.sort();
            let mut txns: Vec<(TransactionId, usize, bool)> = state
                .by_txn
                .iter()
                .map(|(id, entry)| (*id, entry.locks.len(), entry.received))
                .collect();
            txns.sort();
            (locks, txns)
        };
        f.debug_struct("LockAccounting")
            .field("locks", &locks)
            .field("txns", &txns)
            .finish()
    }
}
