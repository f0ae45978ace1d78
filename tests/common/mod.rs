//! Shared test utilities for the pipeline integration suites.
//!
//! [`SimulatedServer`] stands in for a server group: it is the manager's
//! [`RemoteChannel`], and [`SimulatedServer::serve`] runs a thread that
//! acknowledges whatever arrives, the way a live server would.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use txnpipe::{
    GroupId, RemoteChannel, RemoteTransactionManager, SealedBatch, SessionId, TransactionId,
    TxnError, TxnResult,
};

pub const GROUP: GroupId = GroupId::new(0);

static INIT_TRACING: Once = Once::new();

/// Route pipeline logs to the test harness (visible with `--nocapture`).
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
            .try_init();
    });
}

/// Poll `cond` until it holds, failing the test after ten seconds.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// SimulatedServer
// ============================================================================

struct ServerState {
    connected: bool,
    session: u64,
    inbox: VecDeque<(u64, SealedBatch)>,
    /// Every transaction the server has acknowledged in a live session
    acknowledged: FxHashSet<TransactionId>,
    deliveries: u64,
    lwms: Vec<TransactionId>,
}

/// In-memory server group
pub struct SimulatedServer {
    state: Mutex<ServerState>,
    arrived: Condvar,
    stopped: AtomicBool,
}

impl SimulatedServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                connected: true,
                session: 0,
                inbox: VecDeque::new(),
                acknowledged: FxHashSet::default(),
                deliveries: 0,
                lwms: Vec::new(),
            }),
            arrived: Condvar::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Drop the link; anything not yet processed is lost
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.inbox.clear();
    }

    /// New session; acks still in flight from the old one become stale
    pub fn reconnect(&self) {
        let mut state = self.state.lock();
        state.session += 1;
        state.connected = true;
    }

    pub fn acknowledged(&self) -> FxHashSet<TransactionId> {
        self.state.lock().acknowledged.clone()
    }

    /// Batches processed, counting resends
    pub fn deliveries(&self) -> u64 {
        self.state.lock().deliveries
    }

    pub fn low_water_marks(&self) -> Vec<TransactionId> {
        self.state.lock().lwms.clone()
    }

    /// Start acknowledging everything sent to this server
    pub fn serve(
        self: &Arc<Self>,
        manager: Arc<RemoteTransactionManager>,
    ) -> JoinHandle<()> {
        let server = Arc::clone(self);
        thread::Builder::new()
            .name("simulated-server".to_string())
            .spawn(move || server.run(&manager))
            .unwrap()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.arrived.notify_all();
    }

    fn run(&self, manager: &RemoteTransactionManager) {
        loop {
            let (session, batch) = {
                let mut state = self.state.lock();
                loop {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(next) = state.inbox.pop_front() {
                        state.deliveries += 1;
                        break next;
                    }
                    self.arrived.wait_for(&mut state, Duration::from_millis(10));
                }
            };

            {
                let mut state = self.state.lock();
                if state.connected && state.session == session {
                    state.acknowledged.extend(batch.transaction_ids());
                }
            }

            let session = SessionId::new(session);
            manager.batch_received(batch.batch_id(), batch.sync_write_transaction_ids());
            manager.received_batch_acknowledgement(batch.batch_id(), GROUP);
            for txn_id in batch.transaction_ids() {
                manager.received_acknowledgement(session, txn_id, GROUP);
            }
        }
    }
}

impl RemoteChannel for SimulatedServer {
    fn send_batch(&self, batch: &SealedBatch) -> TxnResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TxnError::channel("not connected"));
        }
        let session = state.session;
        state.inbox.push_back((session, batch.clone()));
        self.arrived.notify_one();
        Ok(())
    }

    fn send_low_water_mark(&self, _group: GroupId, lwm: TransactionId) -> TxnResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TxnError::channel("not connected"));
        }
        state.lwms.push(lwm);
        Ok(())
    }

    fn is_current_session(&self, session: SessionId) -> bool {
        let state = self.state.lock();
        state.connected && state.session == session.as_u64()
    }
}
