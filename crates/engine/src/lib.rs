//! Client-side transaction pipeline for txnpipe
//!
//! This crate orchestrates the lower layers:
//! - Id generators: transaction, sequence and batch ids
//! - TransactionBatch: folding of commits into wire transactions
//! - TransactionSequencer: batching and pending-queue backpressure
//! - RemoteTransactionManager: sending, acknowledgments, resend on reconnect,
//!   lock flushes, low-water-mark reports and shutdown drain
//!
//! The engine never encodes or transmits bytes. Batches go out through a
//! [`RemoteChannel`] supplied by the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod channel;
pub mod manager;
pub mod sequence;
pub mod sequencer;

pub use batch::{FoldDecision, SealedBatch, TransactionBatch, TransactionEntry};
pub use channel::{LockFlushCallback, RemoteChannel};
pub use manager::{HandshakeInfo, ManagerStats, ManagerStatus, RemoteTransactionManager};
pub use sequence::{BatchIdGenerator, SequenceGenerator, TransactionIdGenerator};
pub use sequencer::TransactionSequencer;
