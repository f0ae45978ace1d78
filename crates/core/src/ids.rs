//! Identifier types
//!
//! Every identifier is a `u64`/`u32` newtype with a NULL sentinel of zero.
//! Generators hand out values starting at one, so a NULL id never names a
//! real transaction, sequence or batch. APIs that may have "no answer"
//! return `Option<Id>`; the NULL constants exist for wire values such as a
//! batch acknowledgment from a server that does not echo batch ids.

use std::fmt;

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            /// The NULL / invalid value
            pub const NULL: $name = $name(0);

            /// Wrap a raw value
            #[inline]
            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            /// Raw value
            #[inline]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }

            /// True for the NULL sentinel
            #[inline]
            pub const fn is_null(&self) -> bool {
                self.0 == 0
            }

            /// The id immediately following this one
            #[inline]
            pub const fn next(&self) -> Self {
                $name(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_null() {
                    write!(f, "{}=[null]", $label)
                } else {
                    write!(f, "{}={}", $label, self.0)
                }
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }
    };
}

counter_id!(
    /// Wire-level identifier of one (possibly folded) transaction
    TransactionId,
    "TransactionID"
);

counter_id!(
    /// Fold-time ordering counter, independent of [`TransactionId`]
    SequenceId,
    "SequenceID"
);

counter_id!(
    /// Identifier of one network batch
    TxnBatchId,
    "TxnBatchID"
);

counter_id!(
    /// Identity of a clustered object; the folding key
    ObjectId,
    "ObjectID"
);

counter_id!(
    /// Connection session; acks from a previous session are ignored
    SessionId,
    "SessionID"
);

/// Server stripe the pipeline talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GroupId(u32);

impl GroupId {
    /// Wrap a raw group number
    pub const fn new(raw: u32) -> Self {
        GroupId(raw)
    }

    /// Raw group number
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupID({})", self.0)
    }
}

/// Name of a distributed lock
///
/// Created by the lock manager; the pipeline only references lock ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockId {
    /// Lock named by an application string
    Named(String),
    /// Lock named by a number
    Numeric(u64),
    /// Lock guarding a single clustered object
    Object(ObjectId),
}

impl LockId {
    /// Convenience constructor for a named lock
    pub fn named(name: impl Into<String>) -> Self {
        LockId::Named(name.into())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Named(name) => write!(f, "StringLockID({})", name),
            LockId::Numeric(n) => write!(f, "LongLockID({})", n),
            LockId::Object(oid) => write!(f, "DsoLockID({})", oid.as_u64()),
        }
    }
}

impl From<&str> for LockId {
    fn from(name: &str) -> Self {
        LockId::Named(name.to_string())
    }
}

impl From<String> for LockId {
    fn from(name: String) -> Self {
        LockId::Named(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_null_ids() {
        assert!(TransactionId::NULL.is_null());
        assert!(TxnBatchId::NULL.is_null());
        assert!(!TransactionId::new(1).is_null());
        assert_eq!(TransactionId::default(), TransactionId::NULL);
    }

    #[test]
    fn test_next_and_ordering() {
        let t = TransactionId::new(41);
        assert_eq!(t.next(), TransactionId::new(42));
        assert!(t < t.next());
        assert_eq!(SequenceId::NULL.next().as_u64(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(TxnBatchId::new(3).to_string(), "TxnBatchID=3");
        assert_eq!(TxnBatchId::NULL.to_string(), "TxnBatchID=[null]");
        assert_eq!(LockId::named("orders").to_string(), "StringLockID(orders)");
        assert_eq!(LockId::Numeric(9).to_string(), "LongLockID(9)");
    }

    #[test]
    fn test_lock_ids_hash_by_value() {
        let mut set = HashSet::new();
        set.insert(LockId::named("a"));
        set.insert(LockId::from("a"));
        set.insert(LockId::from(String::from("a")));
        set.insert(LockId::Object(ObjectId::new(1)));
        set.insert(LockId::Numeric(1));
        assert_eq!(set.len(), 3);
    }
}
