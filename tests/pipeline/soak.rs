//! Sustained load with repeated disconnects
//!
//! Producers commit and flush while the link to the server drops and comes
//! back. Every committed transaction must end up acknowledged, and the
//! pipeline must end empty.

use crate::common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use txnpipe::{
    ClientTransaction, LockId, ObjectId, PipelineConfig, RemoteTransactionManager, TxnType,
};

const PRODUCERS: u64 = 4;
const COMMITS: usize = 300;
const RECONNECTS: usize = 3;

fn soak_config() -> PipelineConfig {
    PipelineConfig {
        max_outstanding_batches: 4,
        max_pending_batches: 8,
        max_transactions_per_batch: 32,
        completed_ack_flush_interval_ms: 20,
        ack_on_exit_timeout_ms: Some(5000),
        ..PipelineConfig::default()
    }
}

#[test]
fn test_soak_with_disconnects() {
    init_tracing();
    let server = SimulatedServer::new();
    let manager =
        Arc::new(RemoteTransactionManager::new(GROUP, soak_config(), server.clone()).unwrap());
    let serving = server.serve(Arc::clone(&manager));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(p);
                let mut committed = FxHashSet::default();
                for i in 0..COMMITS {
                    let lock = format!("P{}-L{}", p, rng.gen_range(0..3));
                    let object = p * 100 + rng.gen_range(1..=20);
                    let txn = ClientTransaction::new(TxnType::Normal)
                        .with_lock(lock.as_str())
                        .with_change(ObjectId::new(object), vec![i as u8; 16]);
                    committed.insert(manager.commit(txn).unwrap());
                    if i % 60 == 59 {
                        manager.flush(&LockId::named(lock)).unwrap();
                    }
                }
                committed
            })
        })
        .collect();

    for cycle in 0..RECONNECTS {
        thread::sleep(Duration::from_millis(20));
        server.disconnect();
        manager.pause(GROUP, 1).unwrap();

        let info = manager.handshake_info().unwrap();
        assert_eq!(
            info.transaction_sequence_ids.len(),
            info.resent_transaction_ids.len() + 1
        );

        server.reconnect();
        manager.unpause(GROUP, cycle).unwrap();
    }

    let mut committed = FxHashSet::default();
    for handle in producers {
        committed.extend(handle.join().unwrap());
    }
    manager.wait_for_all_current_transactions_to_complete().unwrap();

    let acknowledged = server.acknowledged();
    let missing: Vec<_> = committed.difference(&acknowledged).collect();
    assert!(missing.is_empty(), "never acknowledged: {:?}", missing);

    let stats = manager.stats();
    assert_eq!(stats.committed, PRODUCERS * COMMITS as u64);
    assert_eq!(stats.incomplete_batches, 0);
    assert!(server.deliveries() > 0);

    let lwms = server.low_water_marks();
    assert!(lwms.windows(2).all(|w| w[0] <= w[1]), "mark regressed: {:?}", lwms);

    manager.stop(true).unwrap();
    server.stop();
    serving.join().unwrap();
}
