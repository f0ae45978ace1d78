//! Error types for txnpipe
//!
//! This module defines the error taxonomy of the transaction pipeline.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Accounting structures never fail: unknown or duplicate acknowledgments are
//! no-ops. Only blocking waits, lifecycle transitions, configuration loading
//! and thread spawning produce errors.

use std::io;
use thiserror::Error;

/// Result type alias for txnpipe operations
pub type TxnResult<T> = std::result::Result<T, TxnError>;

/// Error types for the transaction pipeline
#[derive(Debug, Error)]
pub enum TxnError {
    /// A transaction with no changes, roots or notifies was committed
    #[error("Attempt to commit an empty transaction")]
    EmptyTransaction,

    /// The pipeline is stopping or has been shut down
    #[error("Transaction pipeline is not running")]
    NotRunning,

    /// A rejoin cleanup is in progress; the caller must retry after rejoin
    #[error("Rejoin in progress")]
    RejoinInProgress,

    /// A blocking wait was cancelled before its condition held
    #[error("Wait interrupted before completion")]
    Interrupted,

    /// Shutdown drain gave up with transactions still unacknowledged
    #[error("Timed out after {waited_ms}ms with {pending} transactions still unacknowledged")]
    DrainTimeout {
        /// Transactions still outstanding when the wait gave up
        pending: usize,
        /// How long the wait lasted
        waited_ms: u64,
    },

    /// A connection or lifecycle event arrived in a state that does not accept it
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state
        from: &'static str,
        /// Requested state
        to: &'static str,
    },

    /// The remote channel refused a message
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (config files, thread spawning)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TxnError {
    /// Create a channel error from any displayable cause
    pub fn channel(msg: impl Into<String>) -> Self {
        TxnError::Channel(msg.into())
    }

    /// Create a configuration error from any displayable cause
    pub fn config(msg: impl Into<String>) -> Self {
        TxnError::Config(msg.into())
    }

    /// True for errors produced by an abandoned blocking wait.
    ///
    /// Shutdown code uses this to tell "drained" apart from "gave up".
    pub fn is_abandoned_wait(&self) -> bool {
        matches!(self, TxnError::Interrupted | TxnError::DrainTimeout { .. })
    }
}
