//! NEW_TXN, ABORT, READ and timer expiry

use crate::error::{ErrorCode, Result};
use crate::protocol::Response;
use crate::txn::{LogOperation, Transaction, TxnId, TxnStatus};
use super::{log_failure, ResponseSink, Services};

/// Open a transaction for `file_name` and acknowledge it with the new id
pub fn handle_new_txn(services: &Services, file_name: &str, sink: &dyn ResponseSink) -> Result<()> {
    if file_name.is_empty() {
        sink.send(Response::error(
            0,
            ErrorCode::WrongMessageFormat,
            "NEW_TXN requires a file name",
        ));
        return Ok(());
    }

    let txn_id = services.manager.allocate_id();
    let op = LogOperation::NewTxn {
        file_name: file_name.to_string(),
    };
    if let Err(e) = services.log.append_durable(txn_id, 0, op) {
        log::error!("Could not log NEW_TXN for '{}': {}", file_name, e);
        return Err(log_failure(e));
    }

    services.manager.register(Transaction::new(txn_id, file_name))?;
    log::info!("Transaction {} started for '{}'", txn_id, file_name);
    sink.send(Response::Ack { txn_id, seq: 0 });
    Ok(())
}

/// Abort an active transaction. Aborting twice re-acknowledges.
pub fn handle_abort(services: &Services, txn_id: TxnId, sink: &dyn ResponseSink) -> Result<()> {
    let Some(txn) = services.manager.lookup(txn_id) else {
        sink.send(Response::error(
            txn_id,
            ErrorCode::InvalidTransactionId,
            format!(
                "Transaction with ID ({}) does not exist. Abort could not be executed.",
                txn_id
            ),
        ));
        return Ok(());
    };

    let mut state = txn.lock();
    match state.status() {
        TxnStatus::Aborted => {
            sink.send(Response::Ack { txn_id, seq: 0 });
        }
        status @ (TxnStatus::Committed | TxnStatus::TimerExpired) => {
            sink.send(Response::error(
                txn_id,
                ErrorCode::InvalidOperation,
                format!(
                    "Transaction with ID ({}) is {} and cannot be aborted",
                    txn_id,
                    status.as_str()
                ),
            ));
        }
        TxnStatus::Active => {
            if let Err(e) = services.log.append_durable(txn_id, 0, LogOperation::Abort) {
                log::error!("Transaction {}: could not log ABORT: {}", txn_id, e);
                return Err(log_failure(e));
            }
            state.transition(TxnStatus::Aborted);
            log::info!("Transaction {} aborted", txn_id);
            sink.send(Response::Ack { txn_id, seq: 0 });
        }
    }
    Ok(())
}

/// Send back the contents of a previously committed file
pub fn handle_read(services: &Services, file_name: &str, sink: &dyn ResponseSink) -> Result<()> {
    match services.store.read_file(file_name) {
        Ok(data) => {
            log::debug!("READ '{}': {} bytes", file_name, data.len());
            sink.send(Response::ReadReply { data });
        }
        Err(e) => {
            let code = ErrorCode::from_io(&e);
            sink.send(Response::error(
                0,
                code,
                format!("could not read \"{}\": {}", file_name, e),
            ));
        }
    }
    Ok(())
}

/// Mark a transaction TIMER_EXPIRED.
///
/// Returns the status the transaction ends up in, or `None` if the id is
/// unknown. A transaction that already reached a terminal status keeps it.
pub fn expire(services: &Services, txn_id: TxnId) -> Result<Option<TxnStatus>> {
    let Some(txn) = services.manager.lookup(txn_id) else {
        return Ok(None);
    };

    let mut state = txn.lock();
    if state.status().is_terminal() {
        return Ok(Some(state.status()));
    }

    services
        .log
        .append_durable(txn_id, 0, LogOperation::TimerExpired)
        .map_err(log_failure)?;
    state.transition(TxnStatus::TimerExpired);
    log::info!("Transaction {} expired", txn_id);
    Ok(Some(state.status()))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::handler::test_support::{FakeStore, FlakyLog, Harness};
    use crate::store::DurableStore;
    use crate::txn::{RecoveryLog, TransactionManager};
    use crate::handler::{handle_commit, handle_write, ResponseBuffer};

    fn expect_error(sink: &ResponseBuffer) -> ErrorCode {
        match sink.take().as_slice() {
            [Response::Error { code, .. }] => *code,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_new_txn_acks_fresh_ids() {
        let h = Harness::new();
        let sink = ResponseBuffer::new();

        handle_new_txn(&h.services, "a.txt", &sink).unwrap();
        handle_new_txn(&h.services, "b.txt", &sink).unwrap();

        let ids: Vec<TxnId> = sink
            .take()
            .into_iter()
            .map(|r| match r {
                Response::Ack { txn_id, seq: 0 } => txn_id,
                other => panic!("unexpected: {:?}", other),
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let txn = h.services.manager.lookup(ids[1]).unwrap();
        assert_eq!(txn.file_name(), "b.txt");
        assert_eq!(txn.status(), TxnStatus::Active);

        let records = h.log.inner.records();
        assert_eq!(records[0].op, LogOperation::NewTxn { file_name: "a.txt".into() });
    }

    #[test]
    fn test_new_txn_empty_name_rejected() {
        let h = Harness::new();
        let sink = ResponseBuffer::new();

        handle_new_txn(&h.services, "", &sink).unwrap();
        assert_eq!(expect_error(&sink), ErrorCode::WrongMessageFormat);
        assert!(h.services.manager.is_empty());
    }

    #[test]
    fn test_new_txn_log_failure_registers_nothing() {
        let h = Harness::new();
        let sink = ResponseBuffer::new();
        h.log.failing.store(true, Ordering::SeqCst);

        let err = handle_new_txn(&h.services, "x.txt", &sink).unwrap_err();
        assert!(err.is_fatal());
        assert!(sink.is_empty());
        assert!(h.services.manager.is_empty());
    }

    #[test]
    fn test_abort_is_idempotent() {
        let h = Harness::new();
        let txn_id = h.txn_with_fragments("ab.txt", &[1, 2]);
        let sink = ResponseBuffer::new();

        handle_abort(&h.services, txn_id, &sink).unwrap();
        let log_len = h.log.inner.len();
        handle_abort(&h.services, txn_id, &sink).unwrap();

        assert_eq!(
            sink.take(),
            vec![Response::Ack { txn_id, seq: 0 }, Response::Ack { txn_id, seq: 0 }]
        );
        assert_eq!(h.log.inner.len(), log_len);
        let txn = h.services.manager.lookup(txn_id).unwrap();
        assert_eq!(txn.status(), TxnStatus::Aborted);
        assert_eq!(txn.lock().received_count(), 0);
    }

    #[test]
    fn test_abort_after_commit_rejected() {
        let h = Harness::new();
        let txn_id = h.txn_with_fragments("ac.txt", &[1]);
        let sink = ResponseBuffer::new();
        handle_commit(&h.services, txn_id, 1, &sink).unwrap();
        sink.take();

        handle_abort(&h.services, txn_id, &sink).unwrap();
        assert_eq!(expect_error(&sink), ErrorCode::InvalidOperation);
        assert_eq!(h.services.manager.lookup(txn_id).unwrap().status(), TxnStatus::Committed);
    }

    #[test]
    fn test_abort_unknown_and_log_failure() {
        let h = Harness::new();
        let sink = ResponseBuffer::new();

        handle_abort(&h.services, 404, &sink).unwrap();
        assert_eq!(expect_error(&sink), ErrorCode::InvalidTransactionId);

        let txn_id = h.txn_with_fragments("lf.txt", &[]);
        h.log.failing.store(true, Ordering::SeqCst);
        let err = handle_abort(&h.services, txn_id, &sink).unwrap_err();
        assert!(err.is_fatal());
        assert!(sink.is_empty());
        assert_eq!(h.services.manager.lookup(txn_id).unwrap().status(), TxnStatus::Active);
    }

    #[test]
    fn test_read_committed_and_missing() {
        let h = Harness::new();
        let txn_id = h.txn_with_fragments("r.txt", &[1, 2]);
        let sink = ResponseBuffer::new();
        handle_commit(&h.services, txn_id, 2, &sink).unwrap();
        sink.take();

        handle_read(&h.services, "r.txt", &sink).unwrap();
        assert_eq!(sink.take(), vec![Response::ReadReply { data: b"<1><2>".to_vec() }]);

        handle_read(&h.services, "missing.txt", &sink).unwrap();
        assert_eq!(expect_error(&sink), ErrorCode::FileNotFound);
    }

    #[test]
    fn test_expire_active_then_terminal_noop() {
        let h = Harness::new();
        let txn_id = h.txn_with_fragments("e.txt", &[1]);

        assert_eq!(expire(&h.services, txn_id).unwrap(), Some(TxnStatus::TimerExpired));
        let log_len = h.log.inner.len();
        assert_eq!(expire(&h.services, txn_id).unwrap(), Some(TxnStatus::TimerExpired));
        assert_eq!(h.log.inner.len(), log_len);

        let sink = ResponseBuffer::new();
        handle_write(&h.services, txn_id, 2, b"x".to_vec(), &sink).unwrap();
        assert_eq!(expect_error(&sink), ErrorCode::InvalidOperation);
    }

    #[test]
    fn test_expire_after_commit_keeps_committed() {
        let h = Harness::new();
        let txn_id = h.txn_with_fragments("ec.txt", &[1]);
        let sink = ResponseBuffer::new();
        handle_commit(&h.services, txn_id, 1, &sink).unwrap();

        assert_eq!(expire(&h.services, txn_id).unwrap(), Some(TxnStatus::Committed));
        assert_eq!(expire(&h.services, 12345).unwrap(), None);
    }

    #[test]
    fn test_expire_log_failure_is_fatal() {
        let h = Harness::new();
        let txn_id = h.txn_with_fragments("ef.txt", &[1]);
        h.log.failing.store(true, Ordering::SeqCst);

        assert!(expire(&h.services, txn_id).unwrap_err().is_fatal());
        assert_eq!(h.services.manager.lookup(txn_id).unwrap().status(), TxnStatus::Active);
    }

    /// Store whose writes park until the test lets them through
    struct GatedStore {
        inner: FakeStore,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl DurableStore for GatedStore {
        fn write_file(&self, file_name: &str, data: &[u8]) -> io::Result<()> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.inner.write_file(file_name, data)
        }

        fn read_file(&self, file_name: &str) -> io::Result<Vec<u8>> {
            self.inner.read_file(file_name)
        }
    }

    #[test]
    fn test_expire_waits_for_in_flight_commit() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: FakeStore::default(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let log = Arc::new(FlakyLog::default());
        let services = Services::new(
            Arc::new(TransactionManager::new()),
            Arc::clone(&log) as Arc<dyn RecoveryLog>,
            Arc::clone(&store) as Arc<dyn DurableStore>,
        );

        let sink = ResponseBuffer::new();
        handle_new_txn(&services, "race.txt", &sink).unwrap();
        let txn_id = match sink.take().as_slice() {
            [Response::Ack { txn_id, .. }] => *txn_id,
            other => panic!("unexpected: {:?}", other),
        };
        handle_write(&services, txn_id, 1, b"data".to_vec(), &sink).unwrap();

        thread::scope(|scope| {
            let committer = scope.spawn(|| {
                let sink = ResponseBuffer::new();
                handle_commit(&services, txn_id, 1, &sink).unwrap();
                sink.take()
            });

            // The commit now holds the transaction lock inside the file write
            entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let expirer = scope.spawn(|| expire(&services, txn_id).unwrap());
            thread::sleep(Duration::from_millis(50));
            let expired_early = expirer.is_finished();

            release_tx.send(()).unwrap();
            assert!(!expired_early);
            assert_eq!(committer.join().unwrap(), vec![Response::Ack { txn_id, seq: 1 }]);
            assert_eq!(expirer.join().unwrap(), Some(TxnStatus::Committed));
        });

        let records = log.inner.records();
        assert_eq!(records.iter().filter(|r| r.op == LogOperation::Commit).count(), 1);
        assert!(!records.iter().any(|r| r.op == LogOperation::TimerExpired));
        assert_eq!(store.inner.file("race.txt").unwrap(), b"data".to_vec());
    }
}
