//! Remote transaction manager
//!
//! Orchestrates one server group's pipeline:
//! commit -> sequencer -> sender thread -> channel -> acknowledgment ->
//! (resend on reconnect) -> (drain on stop), plus lock flushes.
//!
//! # Threads
//!
//! - `txnpipe-sender-<group>`: the only thread that sends. It resends the
//!   unpause queue first, then pulls new batches from the sequencer while
//!   fewer than `max_outstanding_batches` await a batch acknowledgment and
//!   fewer than twice that many are incomplete.
//! - `txnpipe-lwm-<group>`: reports the completed-transaction low-water mark
//!   every `completed_ack_flush_interval_ms` while running.
//!
//! Both threads exit when the manager is stopped, shut down or dropped.
//!
//! # Lock Ordering
//!
//! ```text
//! admission -> state -> batch accounting
//! admission -> state -> sequencer -> lock accounting
//! flush callbacks -> lock accounting
//! ```
//!
//! Commits hold admission shared; stop and cleanup take it exclusively only
//! after publishing their new status, so no commit passes the status check
//! and then lands in a pipeline that has already been drained or reset.
//!
//! Channel calls, flush callbacks and blocking waits happen with no manager
//! lock held, except the low-water-mark send which holds only its own mutex.

use crate::batch::SealedBatch;
use crate::channel::{LockFlushCallback, RemoteChannel};
use crate::sequencer::TransactionSequencer;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use txnpipe_concurrency::{BatchAccounting, LockAccounting};
use txnpipe_core::{
    AckOnExit, ClientTransaction, GroupId, LockId, PipelineConfig, SequenceId, SessionId,
    TransactionId, TxnBatchId, TxnError, TxnResult, CONFIG_FILE_NAME,
};

/// Commits slower than this to enter the sequencer are logged
const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_secs(1);

/// Sender wait for a new batch before re-checking its state
const SENDER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sender wait for capacity before re-checking its state
const SENDER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Stop and cleanup wait for in-flight commits in slices of this length
const ADMISSION_POLL: Duration = Duration::from_millis(10);

/// Connection and lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    /// Connected, sending
    Running,
    /// Disconnected
    Paused,
    /// Reconnect handshake in progress
    Starting,
    /// Server lost this client's state; pipeline being reset
    RejoinInProgress,
    /// Draining before stop
    StopInitiated,
    /// Stopped
    Stopped,
}

impl ManagerStatus {
    /// Upper-case name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerStatus::Running => "RUNNING",
            ManagerStatus::Paused => "PAUSED",
            ManagerStatus::Starting => "STARTING",
            ManagerStatus::RejoinInProgress => "REJOIN_IN_PROGRESS",
            ManagerStatus::StopInitiated => "STOP_INITIATED",
            ManagerStatus::Stopped => "STOPPED",
        }
    }

    fn can_send(&self) -> bool {
        matches!(self, ManagerStatus::Running | ManagerStatus::StopInitiated)
    }

    fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, ManagerStatus::StopInitiated | ManagerStatus::Stopped)
    }

    fn transition_error(&self, to: ManagerStatus) -> TxnError {
        TxnError::InvalidStateTransition {
            from: self.as_str(),
            to: to.as_str(),
        }
    }
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ids the server needs to resume after a reconnect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Sequence ids of unacknowledged transactions in incomplete batches,
    /// followed by the next sequence id not yet sent
    pub transaction_sequence_ids: Vec<SequenceId>,
    /// Unacknowledged transactions that will be resent
    pub resent_transaction_ids: Vec<TransactionId>,
}

/// Manager metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Commits accepted
    pub committed: u64,
    /// Commits folded into an existing wire transaction
    pub folded: u64,
    /// Batches handed to the channel for the first time
    pub batches_sent: u64,
    /// Batches handed to the channel again after a reconnect
    pub batches_resent: u64,
    /// Channel send errors
    pub send_failures: u64,
    /// Transaction acknowledgments processed
    pub acks: u64,
    /// Acknowledgments dropped as stale or foreign
    pub ignored_acks: u64,
    /// Low-water marks reported
    pub low_water_marks_sent: u64,
    /// Batches sent and not yet fully acknowledged
    pub incomplete_batches: usize,
    /// Batches awaiting a batch acknowledgment
    pub awaiting_batch_ack: usize,
    /// Batches cut but not yet taken by the sender
    pub pending_batches: usize,
}

impl ManagerStats {
    /// Share of commits that were folded
    pub fn fold_rate(&self) -> f64 {
        if self.committed > 0 {
            self.folded as f64 / self.committed as f64
        } else {
            0.0
        }
    }
}

/// Relaxed counters; purely observational
#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    folded: AtomicU64,
    batches_sent: AtomicU64,
    batches_resent: AtomicU64,
    send_failures: AtomicU64,
    acks: AtomicU64,
    ignored_acks: AtomicU64,
    low_water_marks_sent: AtomicU64,
}

struct DispatchState {
    status: ManagerStatus,
    /// Sent and not fully acknowledged
    incomplete: FxHashMap<TxnBatchId, SealedBatch>,
    /// Send slots in use, oldest first
    awaiting_batch_ack: VecDeque<TxnBatchId>,
    /// Incomplete batches to send again, in registration order
    resend: VecDeque<SealedBatch>,
    sender_busy: bool,
    resending: bool,
    throttled: bool,
}

impl DispatchState {
    fn has_send_capacity(&self, max_outstanding: usize) -> bool {
        let ceiling = if self.throttled { 1 } else { max_outstanding };
        self.awaiting_batch_ack.len() < ceiling && self.incomplete.len() < max_outstanding * 2
    }
}

enum SendJob {
    Resend(SealedBatch),
    Fresh,
}

struct ManagerInner {
    group: GroupId,
    config: PipelineConfig,
    channel: Arc<dyn RemoteChannel>,
    sequencer: TransactionSequencer,
    lock_accounting: Arc<LockAccounting>,
    batch_accounting: BatchAccounting,
    state: Mutex<DispatchState>,
    state_changed: Condvar,
    flush_callbacks: Mutex<FxHashMap<LockId, Vec<Box<dyn LockFlushCallback>>>>,
    /// Held shared by a commit from its status check until the sequencer has
    /// taken it; stop and cleanup take it exclusively after changing status
    admission: RwLock<()>,
    /// Last low-water mark reported
    current_lwm: Mutex<Option<TransactionId>>,
    lwm_signal: Condvar,
    shutdown_flag: AtomicBool,
    immediate_shutdown: AtomicBool,
    counters: Counters,
}

/// Client-side transaction pipeline for one server group
///
/// # Example
///
/// ```text
/// use txnpipe_engine::RemoteTransactionManager;
///
/// let manager = RemoteTransactionManager::new(group, PipelineConfig::default(), channel)?;
/// let txn_id = manager.commit(txn)?;
/// manager.flush(&lock)?;
/// manager.stop(true)?;
/// ```
pub struct RemoteTransactionManager {
    inner: Arc<ManagerInner>,
    sender_thread: Mutex<Option<JoinHandle<()>>>,
    lwm_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteTransactionManager {
    /// Create a running manager and start its threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a thread cannot
    /// be spawned.
    pub fn new(
        group: GroupId,
        config: PipelineConfig,
        channel: Arc<dyn RemoteChannel>,
    ) -> TxnResult<Self> {
        config.validate()?;
        let lock_accounting = Arc::new(LockAccounting::new());
        let sequencer = TransactionSequencer::new(&config, Arc::clone(&lock_accounting));

        let inner = Arc::new(ManagerInner {
            group,
            config,
            channel,
            sequencer,
            lock_accounting,
            batch_accounting: BatchAccounting::new(),
            state: Mutex::new(DispatchState {
                status: ManagerStatus::Running,
                incomplete: FxHashMap::default(),
                awaiting_batch_ack: VecDeque::new(),
                resend: VecDeque::new(),
                sender_busy: false,
                resending: false,
                throttled: false,
            }),
            state_changed: Condvar::new(),
            flush_callbacks: Mutex::new(FxHashMap::default()),
            admission: RwLock::new(()),
            current_lwm: Mutex::new(None),
            lwm_signal: Condvar::new(),
            shutdown_flag: AtomicBool::new(false),
            immediate_shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let manager = Self {
            inner: Arc::clone(&inner),
            sender_thread: Mutex::new(None),
            lwm_thread: Mutex::new(None),
        };

        let sender = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("txnpipe-sender-{}", group.as_u32()))
            .spawn(move || sender.sender_loop())?;
        *manager.sender_thread.lock() = Some(handle);

        let reporter = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("txnpipe-lwm-{}", group.as_u32()))
            .spawn(move || reporter.lwm_loop())?;
        *manager.lwm_thread.lock() = Some(handle);

        info!(
            target: "txnpipe::manager",
            group = %group,
            max_outstanding = inner.config.max_outstanding_batches,
            max_pending = inner.config.max_pending_batches,
            folding = inner.config.folding.enabled,
            "Transaction manager started"
        );
        Ok(manager)
    }

    /// Create a manager configured from `txnpipe.toml` in `config_dir`.
    ///
    /// The directory is created if needed and a commented default file is
    /// written when none exists.
    pub fn open<P: AsRef<Path>>(
        group: GroupId,
        config_dir: P,
        channel: Arc<dyn RemoteChannel>,
    ) -> TxnResult<Self> {
        let dir = config_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE_NAME);
        PipelineConfig::write_default_if_missing(&path)?;
        let config = PipelineConfig::from_file(&path)?;
        Self::new(group, config, channel)
    }

    /// Group this manager sends to
    pub fn group(&self) -> GroupId {
        self.inner.group
    }

    /// Current status
    pub fn status(&self) -> ManagerStatus {
        self.inner.state.lock().status
    }

    /// Hand a committed transaction to the pipeline.
    ///
    /// Returns the wire transaction carrying it, without waiting for any
    /// acknowledgment. May block on backpressure.
    ///
    /// # Errors
    ///
    /// - [`TxnError::EmptyTransaction`] if there is nothing to send
    /// - [`TxnError::RejoinInProgress`] while the pipeline is being reset
    /// - [`TxnError::NotRunning`] once stop or shutdown has begun
    pub fn commit(&self, txn: ClientTransaction) -> TxnResult<TransactionId> {
        if !txn.has_changes_or_notifies() {
            return Err(TxnError::EmptyTransaction);
        }
        let _admission = self.inner.admission.read();
        match self.inner.state.lock().status {
            ManagerStatus::RejoinInProgress => return Err(TxnError::RejoinInProgress),
            status if status.is_stopping_or_stopped() => return Err(TxnError::NotRunning),
            _ => {}
        }

        let start = Instant::now();
        let decision = self.inner.sequencer.add_transaction(txn)?;
        let elapsed = start.elapsed();
        if elapsed > SLOW_COMMIT_THRESHOLD {
            info!(
                target: "txnpipe::txn",
                txn_id = %decision.txn_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Commit took more than {}ms to enter the sequencer",
                SLOW_COMMIT_THRESHOLD.as_millis()
            );
        }

        self.inner.counters.committed.fetch_add(1, Ordering::Relaxed);
        if decision.is_folded() {
            self.inner.counters.folded.fetch_add(1, Ordering::Relaxed);
        }
        trace!(target: "txnpipe::txn", txn_id = %decision.txn_id(), folded = decision.is_folded(), "Committed");
        Ok(decision.txn_id())
    }

    /// Block until every transaction written under `lock` is acknowledged.
    ///
    /// Returns at once if nothing is outstanding.
    ///
    /// # Errors
    ///
    /// [`TxnError::Interrupted`] if the wait is cancelled (immediate
    /// shutdown, rejoin), [`TxnError::NotRunning`] after shutdown.
    pub fn flush(&self, lock: &LockId) -> TxnResult<()> {
        self.inner.lock_accounting.wait_until_lock_flushed(lock)
    }

    /// Non-blocking flush.
    ///
    /// Returns `true` if `lock` has nothing outstanding; the callback is then
    /// dropped unused. Otherwise registers the callback, which fires once
    /// on the acknowledgment that drains the lock, and returns `false`.
    pub fn async_flush<C>(&self, lock: &LockId, callback: C) -> bool
    where
        C: LockFlushCallback + 'static,
    {
        let mut callbacks = self.inner.flush_callbacks.lock();
        if self.inner.lock_accounting.transactions_for(lock).is_empty() {
            return true;
        }
        callbacks
            .entry(lock.clone())
            .or_default()
            .push(Box::new(callback));
        false
    }

    /// Process a transaction acknowledgment.
    ///
    /// Returns the batch this acknowledgment completed. Acknowledgments from
    /// a stale session or another group, and unknown or repeated ids, change
    /// nothing.
    pub fn received_acknowledgement(
        &self,
        session: SessionId,
        txn_id: TransactionId,
        group: GroupId,
    ) -> Option<TxnBatchId> {
        self.inner.received_acknowledgement(session, txn_id, group)
    }

    /// Process a batch acknowledgment, freeing one send slot.
    ///
    /// A NULL id frees the oldest slot. Unknown ids are ignored.
    pub fn received_batch_acknowledgement(&self, batch_id: TxnBatchId, group: GroupId) {
        let inner = &self.inner;
        if group != inner.group {
            warn!(target: "txnpipe::batch", group = %group, batch_id = %batch_id, "Ignoring batch ack for another group");
            return;
        }
        let mut state = inner.state.lock();
        if !state.status.can_send() {
            warn!(target: "txnpipe::batch", status = %state.status, batch_id = %batch_id, "Received batch ack while not running");
            return;
        }
        let freed = if batch_id.is_null() {
            state.awaiting_batch_ack.pop_front()
        } else {
            let position = state.awaiting_batch_ack.iter().position(|id| *id == batch_id);
            position.and_then(|at| state.awaiting_batch_ack.remove(at))
        };
        match freed {
            Some(id) => trace!(target: "txnpipe::batch", batch_id = %id, "Send slot freed"),
            None => debug!(target: "txnpipe::batch", batch_id = %batch_id, "Batch ack for no awaiting batch"),
        }
        inner.state_changed.notify_all();
    }

    /// The server has received `batch_id`, including these sync-write
    /// transactions.
    pub fn batch_received<I>(&self, batch_id: TxnBatchId, sync_txns: I)
    where
        I: IntoIterator<Item = TransactionId>,
    {
        trace!(target: "txnpipe::batch", batch_id = %batch_id, "Batch received by server");
        self.inner.lock_accounting.transactions_received(sync_txns);
    }

    /// Block until the server has received every outstanding transaction
    /// written under `lock`.
    pub fn wait_for_server_to_receive_txns_for_lock(&self, lock: &LockId) -> TxnResult<()> {
        self.inner.lock_accounting.wait_until_received_for(lock)
    }

    /// Block until every transaction committed so far is acknowledged
    pub fn wait_for_all_current_transactions_to_complete(&self) -> TxnResult<()> {
        self.inner.lock_accounting.wait_all_current_txn_completed(None)
    }

    /// Connection to the group was lost.
    ///
    /// Stops sending and waits for the sender to go idle.
    ///
    /// # Errors
    ///
    /// [`TxnError::InvalidStateTransition`] if already paused.
    pub fn pause(&self, group: GroupId, disconnected: usize) -> TxnResult<()> {
        let inner = &self.inner;
        if inner.shutdown_flag.load(Ordering::SeqCst) || group != inner.group {
            return Ok(());
        }
        *inner.current_lwm.lock() = None;

        let mut state = inner.state.lock();
        if state.status.is_stopping_or_stopped() {
            return Ok(());
        }
        if state.status == ManagerStatus::Paused {
            return Err(state.status.transition_error(ManagerStatus::Paused));
        }
        info!(target: "txnpipe::manager", group = %group, from = %state.status, disconnected, "Pausing");
        state.status = ManagerStatus::Paused;
        state.resend.clear();
        inner.state_changed.notify_all();

        inner.sequencer.wake();
        while state.sender_busy && !inner.shutdown_flag.load(Ordering::SeqCst) {
            inner.state_changed.wait_for(&mut state, SENDER_IDLE_WAIT);
        }
        Ok(())
    }

    /// Begin the reconnect handshake.
    ///
    /// Moves to [`ManagerStatus::Starting`] and returns what the server needs
    /// to resume.
    ///
    /// # Errors
    ///
    /// [`TxnError::InvalidStateTransition`] unless paused or rejoining.
    pub fn handshake_info(&self) -> TxnResult<HandshakeInfo> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !matches!(
            state.status,
            ManagerStatus::Paused | ManagerStatus::RejoinInProgress
        ) {
            return Err(state.status.transition_error(ManagerStatus::Starting));
        }
        state.status = ManagerStatus::Starting;

        let mut info = HandshakeInfo::default();
        let mut batch_ids = Vec::new();
        inner.batch_accounting.add_incomplete_batch_ids_to(&mut batch_ids);
        for batch_id in batch_ids {
            let Some(batch) = state.incomplete.get(&batch_id) else {
                warn!(target: "txnpipe::manager", batch_id = %batch_id, "Incomplete batch missing from send record");
                continue;
            };
            for entry in batch.entries() {
                if inner
                    .batch_accounting
                    .batch_for_transaction(entry.txn_id())
                    .is_some()
                {
                    info.transaction_sequence_ids.push(entry.sequence_id());
                    info.resent_transaction_ids.push(entry.txn_id());
                }
            }
        }
        info.transaction_sequence_ids
            .push(inner.sequencer.next_sequence_id());

        debug!(
            target: "txnpipe::manager",
            resent = info.resent_transaction_ids.len(),
            "Handshake prepared"
        );
        Ok(info)
    }

    /// Connection restored.
    ///
    /// Queues every incomplete batch for resend, oldest first, resumes
    /// sending, and returns once the resend queue has been handed to the
    /// channel. New batches are only sent after the whole queue.
    ///
    /// # Errors
    ///
    /// [`TxnError::InvalidStateTransition`] if already running.
    pub fn unpause(&self, group: GroupId, disconnected: usize) -> TxnResult<()> {
        let inner = &self.inner;
        if inner.shutdown_flag.load(Ordering::SeqCst) || group != inner.group {
            return Ok(());
        }

        let mut state = inner.state.lock();
        if state.status.is_stopping_or_stopped() {
            return Ok(());
        }
        if state.status == ManagerStatus::Running {
            return Err(state.status.transition_error(ManagerStatus::Running));
        }

        let mut batch_ids = Vec::new();
        inner.batch_accounting.add_incomplete_batch_ids_to(&mut batch_ids);
        let mut resend = VecDeque::with_capacity(batch_ids.len());
        let mut last_sequence: Option<SequenceId> = None;
        for batch_id in &batch_ids {
            let Some(batch) = state.incomplete.get(batch_id) else {
                warn!(target: "txnpipe::manager", batch_id = %batch_id, "Incomplete batch missing from send record");
                continue;
            };
            for sid in batch.sequence_ids() {
                if let Some(last) = last_sequence {
                    if last.next() != sid {
                        debug!(target: "txnpipe::manager", last = %last, next = %sid, "Gap in resent sequence ids");
                    }
                }
                last_sequence = Some(sid);
            }
            resend.push_back(batch.clone());
        }

        info!(
            target: "txnpipe::manager",
            group = %group,
            disconnected,
            resend = resend.len(),
            "Unpausing"
        );
        state.awaiting_batch_ack = resend.iter().map(|b| b.batch_id()).collect();
        state.resend = resend;
        state.status = ManagerStatus::Running;
        inner.state_changed.notify_all();

        while (!state.resend.is_empty() || state.resending)
            && state.status == ManagerStatus::Running
            && !inner.shutdown_flag.load(Ordering::SeqCst)
        {
            inner.state_changed.wait_for(&mut state, SENDER_IDLE_WAIT);
        }
        Ok(())
    }

    /// Stop the pipeline.
    ///
    /// Refuses new commits, then, if `wait_for_ack_on_exit` is set and the
    /// configured ack-on-exit timeout is enabled, waits for every
    /// transaction to be acknowledged (bounded or not, per configuration).
    /// The threads are stopped in every case.
    ///
    /// # Errors
    ///
    /// [`TxnError::DrainTimeout`] or [`TxnError::Interrupted`] if the drain
    /// was abandoned. Shutdown has completed when either is returned.
    pub fn stop(&self, wait_for_ack_on_exit: bool) -> TxnResult<()> {
        let inner = &self.inner;
        let start = Instant::now();
        {
            let mut state = inner.state.lock();
            if state.status == ManagerStatus::Stopped {
                return Ok(());
            }
            state.status = ManagerStatus::StopInitiated;
            inner.state_changed.notify_all();
        }
        debug!(target: "txnpipe::manager", group = %inner.group, "Stop initiated");

        let timeout = match inner.config.ack_on_exit() {
            _ if !wait_for_ack_on_exit || inner.immediate_shutdown.load(Ordering::SeqCst) => None,
            AckOnExit::Disabled => None,
            AckOnExit::Unbounded => Some(None),
            AckOnExit::Bounded(limit) => Some(Some(limit)),
        };

        let mut outcome = Ok(());
        if let Some(timeout) = timeout {
            let barrier_start = Instant::now();
            inner.await_admitted_commits(timeout);
            let remaining = timeout.map(|limit| limit.saturating_sub(barrier_start.elapsed()));
            if let Err(e) = inner.lock_accounting.wait_all_current_txn_completed(remaining) {
                error!(
                    target: "txnpipe::manager",
                    incomplete_batches = inner.batch_accounting.incomplete_len(),
                    unacked = inner.lock_accounting.size_of_transaction_map(),
                    error = %e,
                    "Stopping with unacknowledged transactions"
                );
                outcome = Err(e);
            }
        }

        {
            let mut state = inner.state.lock();
            state.status = ManagerStatus::Stopped;
            inner.state_changed.notify_all();
        }
        self.stop_threads();

        info!(
            target: "txnpipe::manager",
            group = %inner.group,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stopped"
        );
        outcome
    }

    /// Cancel the drain of a stop in progress, and skip the drain of any
    /// later stop. Flushes in progress fail with [`TxnError::Interrupted`].
    pub fn request_immediate_shutdown(&self) {
        self.inner.immediate_shutdown.store(true, Ordering::SeqCst);
        self.inner.lock_accounting.interrupt_waiters();
        self.inner.state_changed.notify_all();
    }

    /// Tear down at once: waits fail with [`TxnError::NotRunning`], commits
    /// are refused and the threads exit.
    pub fn shutdown(&self) {
        self.inner.lock_accounting.shutdown();
        self.stop_threads();
        info!(target: "txnpipe::manager", group = %self.inner.group, "Shut down");
    }

    /// Reset for rejoin: the server has lost this client's state.
    ///
    /// Drops every batch, queued commit, accounting entry and flush
    /// callback. Flushes in progress fail with [`TxnError::Interrupted`].
    ///
    /// # Errors
    ///
    /// [`TxnError::InvalidStateTransition`] unless paused or rejoining.
    pub fn cleanup(&self) -> TxnResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if !matches!(
                state.status,
                ManagerStatus::Paused | ManagerStatus::RejoinInProgress
            ) {
                return Err(state.status.transition_error(ManagerStatus::RejoinInProgress));
            }
            state.status = ManagerStatus::RejoinInProgress;
            inner.state_changed.notify_all();
        }

        // Commits blocked on a full queue hold admission; emptying the queue
        // lets them through so the reset below also covers their transactions
        let _admission = loop {
            inner.sequencer.clear();
            if let Some(guard) = inner.admission.try_write_for(ADMISSION_POLL) {
                break Some(guard);
            }
            if inner.shutdown_flag.load(Ordering::SeqCst) {
                break None;
            }
        };
        {
            let mut state = inner.state.lock();
            state.incomplete.clear();
            state.awaiting_batch_ack.clear();
            state.resend.clear();
            inner.batch_accounting.clear();
            inner.sequencer.clear();
            inner.state_changed.notify_all();
        }
        inner.flush_callbacks.lock().clear();
        inner.lock_accounting.clear();
        *inner.current_lwm.lock() = None;
        info!(target: "txnpipe::manager", group = %inner.group, "Pipeline reset for rejoin");
        Ok(())
    }

    /// Temporarily lower the outstanding ceiling to one batch
    pub fn throttle_processing(&self, throttled: bool) {
        let mut state = self.inner.state.lock();
        state.throttled = throttled;
        self.inner.state_changed.notify_all();
    }

    /// Configured outstanding-batch ceiling
    pub fn get_max_outstanding_batches(&self) -> usize {
        self.inner.config.max_outstanding_batches
    }

    /// Batches that can exist before committers block
    pub fn get_max_queued_batches(&self) -> usize {
        self.inner.config.max_outstanding_batches + self.inner.sequencer.max_pending_size()
    }

    /// Metrics snapshot
    pub fn stats(&self) -> ManagerStats {
        let inner = &self.inner;
        let (incomplete_batches, awaiting_batch_ack) = {
            let state = inner.state.lock();
            (state.incomplete.len(), state.awaiting_batch_ack.len())
        };
        let c = &inner.counters;
        ManagerStats {
            committed: c.committed.load(Ordering::Relaxed),
            folded: c.folded.load(Ordering::Relaxed),
            batches_sent: c.batches_sent.load(Ordering::Relaxed),
            batches_resent: c.batches_resent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            acks: c.acks.load(Ordering::Relaxed),
            ignored_acks: c.ignored_acks.load(Ordering::Relaxed),
            low_water_marks_sent: c.low_water_marks_sent.load(Ordering::Relaxed),
            incomplete_batches,
            awaiting_batch_ack,
            pending_batches: inner.sequencer.pending_len(),
        }
    }

    /// Human-readable state dump
    pub fn dump(&self) -> String {
        let inner = &self.inner;
        let state = inner.state.lock();
        format!(
            "RemoteTransactionManager[{}, status={}, incomplete batches={}, awaiting batch ack={}, resend queued={}, throttled={}]\n  {}\n  {}\n  {:?}",
            inner.group,
            state.status,
            state.incomplete.len(),
            state.awaiting_batch_ack.len(),
            state.resend.len(),
            state.throttled,
            inner.batch_accounting,
            inner.lock_accounting,
            inner.sequencer,
        )
    }

    fn stop_threads(&self) {
        let inner = &self.inner;
        inner.shutdown_flag.store(true, Ordering::SeqCst);
        inner.sequencer.shutdown();
        inner.state_changed.notify_all();
        {
            let _guard = inner.current_lwm.lock();
            inner.lwm_signal.notify_all();
        }

        for slot in [&self.sender_thread, &self.lwm_thread] {
            if let Some(handle) = slot.lock().take() {
                if handle.thread().id() == thread::current().id() {
                    continue;
                }
                if handle.join().is_err() {
                    error!(target: "txnpipe::manager", "Pipeline thread panicked");
                }
            }
        }
    }
}

impl Drop for RemoteTransactionManager {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

impl fmt::Debug for RemoteTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

impl ManagerInner {
    fn received_acknowledgement(
        &self,
        session: SessionId,
        txn_id: TransactionId,
        group: GroupId,
    ) -> Option<TxnBatchId> {
        if group != self.group {
            self.counters.ignored_acks.fetch_add(1, Ordering::Relaxed);
            warn!(target: "txnpipe::txn", txn_id = %txn_id, group = %group, "Ignoring ack for another group");
            return None;
        }
        if !self.channel.is_current_session(session) {
            self.counters.ignored_acks.fetch_add(1, Ordering::Relaxed);
            warn!(target: "txnpipe::txn", txn_id = %txn_id, session = %session, "Ignoring ack from previous session");
            return None;
        }
        self.counters.acks.fetch_add(1, Ordering::Relaxed);

        let completed = {
            let mut state = self.state.lock();
            let completed = self.batch_accounting.acknowledge(txn_id);
            if let Some(batch_id) = completed {
                state.incomplete.remove(&batch_id);
                state.awaiting_batch_ack.retain(|id| *id != batch_id);
                trace!(target: "txnpipe::batch", batch_id = %batch_id, "Batch fully acknowledged");
                self.state_changed.notify_all();
            }
            completed
        };

        let fired = {
            let mut callbacks = self.flush_callbacks.lock();
            let vacated = self.lock_accounting.acknowledge(txn_id);
            if callbacks.is_empty() {
                Vec::new()
            } else {
                vacated
                    .into_iter()
                    .filter_map(|lock| callbacks.remove(&lock).map(|list| (lock, list)))
                    .collect::<Vec<_>>()
            }
        };
        for (lock, list) in fired {
            for mut callback in list {
                callback.transactions_for_lock_flushed(&lock);
            }
        }
        completed
    }

    /// Wait until no commit is between its status check and the sequencer.
    ///
    /// Gives up after `limit`, on shutdown or on an immediate shutdown request.
    fn await_admitted_commits(&self, limit: Option<Duration>) {
        let start = Instant::now();
        loop {
            if self.admission.try_write_for(ADMISSION_POLL).is_some() {
                return;
            }
            if self.immediate_shutdown.load(Ordering::SeqCst)
                || self.shutdown_flag.load(Ordering::SeqCst)
                || limit.map_or(false, |limit| start.elapsed() >= limit)
            {
                debug!(target: "txnpipe::manager", "Stopping with commits still entering the sequencer");
                return;
            }
        }
    }

    fn sender_loop(&self) {
        debug!(target: "txnpipe::manager", group = %self.group, "Sender started");
        while let Some(job) = self.next_send_job() {
            match job {
                SendJob::Resend(batch) => {
                    debug!(target: "txnpipe::batch", batch_id = %batch.batch_id(), "Resending batch");
                    if self.transmit(&batch) {
                        self.counters.batches_resent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                SendJob::Fresh => {
                    if let Some(batch) = self.sequencer.wait_next_batch(SENDER_POLL_INTERVAL) {
                        self.register(&batch);
                        if self.transmit(&batch) {
                            self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            let mut state = self.state.lock();
            state.sender_busy = false;
            state.resending = false;
            self.state_changed.notify_all();
        }
        debug!(target: "txnpipe::manager", group = %self.group, "Sender exiting");
    }

    /// Wait for something to send; `None` once shut down
    fn next_send_job(&self) -> Option<SendJob> {
        let mut state = self.state.lock();
        loop {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                return None;
            }
            if state.status.can_send() {
                if let Some(batch) = state.resend.pop_front() {
                    state.sender_busy = true;
                    state.resending = true;
                    return Some(SendJob::Resend(batch));
                }
                if state.has_send_capacity(self.config.max_outstanding_batches) {
                    state.sender_busy = true;
                    return Some(SendJob::Fresh);
                }
            }
            self.state_changed.wait_for(&mut state, SENDER_IDLE_WAIT);
        }
    }

    /// Record a batch as outstanding; always precedes its first send
    fn register(&self, batch: &SealedBatch) {
        let batch_id = batch.batch_id();
        let mut state = self.state.lock();
        if state.incomplete.insert(batch_id, batch.clone()).is_some() {
            warn!(target: "txnpipe::batch", batch_id = %batch_id, "Batch registered twice");
        }
        state.awaiting_batch_ack.push_back(batch_id);
        self.batch_accounting
            .add_batch(batch_id, batch.transaction_ids());
    }

    fn transmit(&self, batch: &SealedBatch) -> bool {
        match self.channel.send_batch(batch) {
            Ok(()) => {
                trace!(
                    target: "txnpipe::batch",
                    batch_id = %batch.batch_id(),
                    txns = batch.number_of_txns_after_folding(),
                    bytes = batch.byte_size(),
                    "Batch sent"
                );
                true
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "txnpipe::batch",
                    batch_id = %batch.batch_id(),
                    error = %e,
                    "Batch send failed, will resend after reconnect"
                );
                false
            }
        }
    }

    fn lwm_loop(&self) {
        let interval = self.config.completed_ack_flush_interval();
        loop {
            {
                let mut guard = self.current_lwm.lock();
                if !self.shutdown_flag.load(Ordering::SeqCst) {
                    self.lwm_signal.wait_for(&mut guard, interval);
                }
            }
            if self.shutdown_flag.load(Ordering::SeqCst) {
                return;
            }
            self.report_low_water_mark();
        }
    }

    fn report_low_water_mark(&self) {
        let status = self.state.lock().status;
        if status != ManagerStatus::Running {
            trace!(target: "txnpipe::manager", status = %status, "Skipping low water mark report");
            return;
        }
        let Some(lwm) = self.batch_accounting.low_water_mark() else {
            return;
        };

        let mut current = self.current_lwm.lock();
        match *current {
            Some(previous) if previous > lwm => {
                error!(
                    target: "txnpipe::manager",
                    previous = %previous,
                    lwm = %lwm,
                    "Low water mark moved down"
                );
                return;
            }
            Some(previous) if previous == lwm => return,
            _ => {}
        }

        match self.channel.send_low_water_mark(self.group, lwm) {
            Ok(()) => {
                *current = Some(lwm);
                self.batch_accounting.clear_completed_transaction_ids();
                self.counters
                    .low_water_marks_sent
                    .fetch_add(1, Ordering::Relaxed);
                trace!(target: "txnpipe::manager", lwm = %lwm, "Low water mark sent");
            }
            Err(e) => {
                warn!(target: "txnpipe::manager", lwm = %lwm, error = %e, "Low water mark send failed");
            }
        }
    }
}
