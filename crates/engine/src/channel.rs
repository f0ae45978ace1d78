//! Seams to the transport and lock layers
//!
//! The pipeline never encodes or transmits anything itself. It hands sealed
//! batches and low-water marks to a [`RemoteChannel`], and reports drained
//! locks through [`LockFlushCallback`].

use crate::batch::SealedBatch;
use txnpipe_core::{GroupId, LockId, SessionId, TransactionId, TxnResult};

/// Outbound half of the connection to one server group
///
/// Sends are at-least-once: an error (or a silent loss on disconnect) is
/// recovered by resending every incomplete batch after the next unpause.
pub trait RemoteChannel: Send + Sync {
    /// Transmit a batch
    fn send_batch(&self, batch: &SealedBatch) -> TxnResult<()>;

    /// Report that every transaction below `low_water_mark` is acknowledged
    fn send_low_water_mark(&self, group: GroupId, low_water_mark: TransactionId) -> TxnResult<()>;

    /// True if acknowledgments from `session` belong to the live connection
    fn is_current_session(&self, session: SessionId) -> bool;
}

/// Notified once a lock has no outstanding transactions
pub trait LockFlushCallback: Send {
    /// Called outside every pipeline lock
    fn transactions_for_lock_flushed(&mut self, lock: &LockId);
}

impl<F> LockFlushCallback for F
where
    F: FnMut(&LockId) + Send,
{
    fn transactions_for_lock_flushed(&mut self, lock: &LockId) {
        self(lock)
    }
}
