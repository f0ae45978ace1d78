//! Property tests for commit folding
//!
//! Random commit streams are fed into a TransactionBatch and the sealed
//! result is checked against the guarantees the pipeline relies on:
//!
//! 1. **Id order** - entries carry strictly increasing transaction and sequence ids
//! 2. **Coverage** - every commit's objects are in the entry that carries it
//! 3. **Type safety** - a commit only ever joins an entry of its own type
//! 4. **Unfoldable commits** - notifies always start a new entry

use proptest::prelude::*;
use txnpipe_core::{ClientTransaction, FoldingConfig, ObjectId, TxnBatchId, TxnType};
use txnpipe_engine::{
    FoldDecision, SequenceGenerator, TransactionBatch, TransactionIdGenerator,
};

#[derive(Debug, Clone)]
struct Commit {
    txn_type: TxnType,
    objects: Vec<u64>,
    notify: bool,
}

impl Commit {
    fn build(&self) -> ClientTransaction {
        let mut txn = ClientTransaction::new(self.txn_type).with_lock(format!("L{}", self.objects[0]));
        for oid in &self.objects {
            txn = txn.with_change(ObjectId::new(*oid), vec![1]);
        }
        if self.notify {
            txn = txn.with_notify();
        }
        txn
    }
}

fn commit_strategy() -> impl Strategy<Value = Commit> {
    (
        prop_oneof![Just(TxnType::Normal), Just(TxnType::Concurrent)],
        prop::collection::vec(1u64..12, 1..4),
        prop::bool::weighted(0.1),
    )
        .prop_map(|(txn_type, objects, notify)| Commit {
            txn_type,
            objects,
            notify,
        })
}

fn run(commits: &[Commit], folding: FoldingConfig) -> (Vec<FoldDecision>, txnpipe_engine::SealedBatch) {
    let sequences = SequenceGenerator::new();
    let txn_ids = TransactionIdGenerator::new();
    let mut batch = TransactionBatch::new(TxnBatchId::new(1), folding);
    let decisions = commits
        .iter()
        .map(|c| batch.add_transaction(c.build(), &sequences, &txn_ids))
        .collect();
    (decisions, batch.seal())
}

// ============================================================================
// SECTION 1: Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_entries_ordered_and_counted(commits in prop::collection::vec(commit_strategy(), 1..40)) {
        let (decisions, sealed) = run(&commits, FoldingConfig::default());

        prop_assert_eq!(sealed.number_of_txns_before_folding(), commits.len());
        let new_entries = decisions.iter().filter(|d| !d.is_folded()).count();
        prop_assert_eq!(sealed.number_of_txns_after_folding(), new_entries);

        let txn_ids: Vec<_> = sealed.transaction_ids().collect();
        let seq_ids: Vec<_> = sealed.sequence_ids().collect();
        prop_assert!(txn_ids.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(seq_ids.windows(2).all(|w| w[0] < w[1]));

        let total: usize = sealed.entries().iter().map(|e| e.commit_count()).sum();
        prop_assert_eq!(total, commits.len());
    }

    #[test]
    fn prop_commit_lands_in_entry_of_same_type(commits in prop::collection::vec(commit_strategy(), 1..40)) {
        let (decisions, sealed) = run(&commits, FoldingConfig::default());

        for (commit, decision) in commits.iter().zip(&decisions) {
            let entry = sealed.entry(decision.txn_id());
            prop_assert!(entry.is_some());
            let entry = entry.unwrap();
            prop_assert_eq!(entry.txn_type(), commit.txn_type);
            prop_assert_eq!(entry.sequence_id(), decision.sequence_id());
            for oid in &commit.objects {
                prop_assert!(entry.changes().iter().any(|(id, _)| id.as_u64() == *oid));
            }
            if commit.notify {
                prop_assert!(!decision.is_folded());
            }
        }
    }

    #[test]
    fn prop_disabled_folding_never_folds(commits in prop::collection::vec(commit_strategy(), 1..40)) {
        let (decisions, sealed) = run(&commits, FoldingConfig::disabled());
        prop_assert!(decisions.iter().all(|d| !d.is_folded()));
        prop_assert_eq!(sealed.number_of_txns_after_folding(), commits.len());
    }
}

// ============================================================================
// SECTION 2: Debug logging
// ============================================================================

#[test]
fn test_debug_logging_does_not_change_decisions() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let commits: Vec<Commit> = (0..20u64)
        .map(|i| Commit {
            txn_type: TxnType::Normal,
            objects: vec![i % 3 + 1],
            notify: i % 7 == 6,
        })
        .collect();
    let debug = FoldingConfig {
        debug: true,
        ..FoldingConfig::default()
    };

    let (quiet, _) = run(&commits, FoldingConfig::default());
    let (logged, _) = run(&commits, debug);
    assert_eq!(quiet, logged);
    assert!(quiet.iter().any(|d| d.is_folded()));
}
