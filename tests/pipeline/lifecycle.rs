//! Manager lifecycle against a live server: configuration from disk,
//! shutdown drain, rejoin, and flush callbacks.

use crate::common::*;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use txnpipe::{
    ClientTransaction, LockId, ManagerStatus, ObjectId, PipelineConfig,
    RemoteTransactionManager, TxnError, TxnType, CONFIG_FILE_NAME,
};

fn write(lock: &str, object: u64) -> ClientTransaction {
    ClientTransaction::new(TxnType::Normal)
        .with_lock(lock)
        .with_change(ObjectId::new(object), vec![9; 8])
}

#[test]
fn test_open_then_drain_on_stop() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        max_outstanding_batches: 2,
        ack_on_exit_timeout_ms: Some(2000),
        ..PipelineConfig::default()
    };
    config
        .write_to_file(&dir.path().join(CONFIG_FILE_NAME))
        .unwrap();

    let server = SimulatedServer::new();
    let manager =
        Arc::new(RemoteTransactionManager::open(GROUP, dir.path(), server.clone()).unwrap());
    assert_eq!(manager.get_max_outstanding_batches(), 2);
    let serving = server.serve(Arc::clone(&manager));

    let mut txns = Vec::new();
    for i in 1..=50 {
        txns.push(manager.commit(write("orders", i % 5 + 1)).unwrap());
    }
    manager.stop(true).unwrap();
    assert_eq!(manager.status(), ManagerStatus::Stopped);

    let acknowledged = server.acknowledged();
    assert!(txns.iter().all(|t| acknowledged.contains(t)));
    assert_eq!(manager.stats().committed, 50);

    server.stop();
    serving.join().unwrap();
}

#[test]
fn test_rejoin_after_server_lost_state() {
    init_tracing();
    let server = SimulatedServer::new();
    let manager = Arc::new(
        RemoteTransactionManager::new(GROUP, PipelineConfig::default(), server.clone()).unwrap(),
    );
    let serving = server.serve(Arc::clone(&manager));

    server.disconnect();
    manager.commit(write("L", 1)).unwrap();
    let m = Arc::clone(&manager);
    let flusher = thread::spawn(move || m.flush(&LockId::named("L")));
    eventually("send attempted", || manager.stats().send_failures > 0);
    // Let the flusher block on the lock before the reset
    thread::sleep(Duration::from_millis(50));

    manager.pause(GROUP, 1).unwrap();
    manager.cleanup().unwrap();
    assert!(matches!(flusher.join().unwrap(), Err(TxnError::Interrupted)));

    let info = manager.handshake_info().unwrap();
    assert!(info.resent_transaction_ids.is_empty());
    assert_eq!(info.transaction_sequence_ids.len(), 1);

    server.reconnect();
    manager.unpause(GROUP, 0).unwrap();
    let t = manager.commit(write("L", 2)).unwrap();
    manager.flush(&LockId::named("L")).unwrap();
    assert!(server.acknowledged().contains(&t));

    manager.stop(false).unwrap();
    server.stop();
    serving.join().unwrap();
}

#[test]
fn test_async_flush_called_from_ack_path() {
    init_tracing();
    let server = SimulatedServer::new();
    let manager = Arc::new(
        RemoteTransactionManager::new(GROUP, PipelineConfig::default(), server.clone()).unwrap(),
    );

    // Nothing is acknowledged until the server starts
    manager.commit(write("L", 1)).unwrap();
    let (tx, rx) = mpsc::channel();
    let immediate = manager.async_flush(&LockId::named("L"), move |lock: &LockId| {
        let _ = tx.send(lock.clone());
    });
    assert!(!immediate);

    let serving = server.serve(Arc::clone(&manager));
    let flushed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(flushed, LockId::named("L"));

    manager.stop(false).unwrap();
    server.stop();
    serving.join().unwrap();
}
