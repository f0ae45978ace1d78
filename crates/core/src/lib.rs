//! Core types for txnpipe
//!
//! This crate defines the foundational types used throughout the pipeline:
//! - Identifiers: TransactionId, SequenceId, TxnBatchId, LockId, ObjectId, SessionId, GroupId
//! - ClientTransaction: one committed unit of work and its TxnType
//! - TxnError: error taxonomy
//! - PipelineConfig: backpressure, batching, folding and ack-on-exit settings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod transaction;

pub use config::{AckOnExit, FoldingConfig, PipelineConfig, CONFIG_FILE_NAME};
pub use error::{TxnError, TxnResult};
pub use ids::{GroupId, LockId, ObjectId, SequenceId, SessionId, TransactionId, TxnBatchId};
pub use transaction::{ClientTransaction, ObjectChange, TxnType};
