//! Acknowledgment accounting for txnpipe
//!
//! This crate holds the two pieces of shared bookkeeping of the pipeline:
//! - BatchAccounting: which transactions of each sent batch are unacknowledged,
//!   batch completion, FIFO resend order, completed low-water mark
//! - LockAccounting: which transactions are outstanding per lock, lock drain
//!   events, flush and shutdown-drain waits
//!
//! Both are internally synchronized. Callers never lock them externally and
//! never get access to their maps; reporting goes through snapshots or the
//! `Debug`/`Display` dumps, which take the same mutex as mutation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch_accounting;
pub mod lock_accounting;

pub use batch_accounting::BatchAccounting;
pub use lock_accounting::{LockAccounting, FLUSH_WAIT_INTERVAL};
