//! txnpipe - client-side transaction pipeline for clustered objects
//!
//! Committed transactions are folded and batched, sent to a server group
//! through a caller-supplied channel, tracked until acknowledged, resent in
//! order after a reconnect, and drained on shutdown. Lock flushes block (or
//! call back) until every transaction written under a lock is acknowledged.
//!
//! # Quick Start
//!
//! ```ignore
//! use txnpipe::{ClientTransaction, GroupId, ObjectId, RemoteTransactionManager, TxnType};
//!
//! let manager = RemoteTransactionManager::open(GroupId::new(0), "client-data", channel)?;
//!
//! let txn = ClientTransaction::new(TxnType::Normal)
//!     .with_lock("orders")
//!     .with_change(ObjectId::new(42), payload);
//! manager.commit(txn)?;
//!
//! // Returns once the server has acknowledged everything under "orders"
//! manager.flush(&"orders".into())?;
//! ```
//!
//! # Architecture
//!
//! - `txnpipe-core`: ids, transactions, errors, configuration
//! - `txnpipe-concurrency`: batch and lock acknowledgment accounting
//! - `txnpipe-engine`: folding, sequencing, sending and the manager lifecycle

pub use txnpipe_concurrency::{BatchAccounting, LockAccounting};
pub use txnpipe_core::{
    AckOnExit, ClientTransaction, FoldingConfig, GroupId, LockId, ObjectChange, ObjectId,
    PipelineConfig, SequenceId, SessionId, TransactionId, TxnBatchId, TxnError, TxnResult,
    TxnType, CONFIG_FILE_NAME,
};
pub use txnpipe_engine::{
    FoldDecision, HandshakeInfo, LockFlushCallback, ManagerStats, ManagerStatus,
    RemoteChannel, RemoteTransactionManager, SealedBatch, TransactionEntry,
};
