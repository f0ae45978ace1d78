//! Monotonic id generators
//!
//! Generators start at one so that no generated id equals the NULL sentinel.
//! They are lock-free and can be shared between threads; within the
//! sequencer they are only advanced under the sequencer mutex, which is what
//! keeps TransactionIds in batch order.

use std::sync::atomic::{AtomicU64, Ordering};
use txnpipe_core::{SequenceId, TransactionId, TxnBatchId};

macro_rules! id_generator {
    ($(#[$meta:meta])* $name:ident, $id:ty) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            next: AtomicU64,
        }

        impl $name {
            /// Generator whose first id is 1
            pub fn new() -> Self {
                Self::starting_at(1)
            }

            /// Generator whose first id is `first` (clamped to at least 1)
            pub fn starting_at(first: u64) -> Self {
                Self {
                    next: AtomicU64::new(first.max(1)),
                }
            }

            /// Hand out the next id
            pub fn next_id(&self) -> $id {
                <$id>::new(self.next.fetch_add(1, Ordering::SeqCst))
            }

            /// The id the next call to `next_id` will return
            pub fn peek(&self) -> $id {
                <$id>::new(self.next.load(Ordering::SeqCst))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

id_generator!(
    /// Source of [`TransactionId`]s
    TransactionIdGenerator,
    TransactionId
);

id_generator!(
    /// Source of [`SequenceId`]s
    SequenceGenerator,
    SequenceId
);

id_generator!(
    /// Source of [`TxnBatchId`]s
    BatchIdGenerator,
    TxnBatchId
);
