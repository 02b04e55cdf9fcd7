//! Request handlers
//!
//! One handler per protocol verb, reached through [`dispatch`]. Handlers are
//! synchronous: the durable file write and the recovery log append block the
//! calling thread while the transaction's lock is held, which serializes work
//! on that one transaction and nothing else.
//!
//! Every client-visible failure is turned into a response on the sink. The
//! only error a handler returns is a fatal one: the recovery log could not
//! record a state change, so nothing the server acknowledges from then on
//! would survive a restart.

use std::sync::{Arc, Mutex};

use crate::error::{DfsError, Result};
use crate::protocol::{Request, Response};
use crate::store::DurableStore;
use crate::txn::{RecoveryLog, TransactionManager};

mod commit;
mod write;
mod lifecycle;

pub use commit::handle_commit;
pub use write::handle_write;
pub use lifecycle::{expire, handle_abort, handle_new_txn, handle_read};

/// Destination for responses produced while handling a request
pub trait ResponseSink: Send + Sync {
    fn send(&self, response: Response);
}

/// Collects responses in order until the connection flushes them
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    responses: Mutex<Vec<Response>>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<Response> {
        std::mem::take(&mut *self.responses.lock().expect("response buffer lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.responses.lock().expect("response buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseSink for ResponseBuffer {
    fn send(&self, response: Response) {
        self.responses
            .lock()
            .expect("response buffer lock poisoned")
            .push(response);
    }
}

/// Shared services every handler works against
#[derive(Clone)]
pub struct Services {
    pub manager: Arc<TransactionManager>,
    pub log: Arc<dyn RecoveryLog>,
    pub store: Arc<dyn DurableStore>,
}

impl Services {
    pub fn new(
        manager: Arc<TransactionManager>,
        log: Arc<dyn RecoveryLog>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self { manager, log, store }
    }
}

/// Classify a failed recovery log append as fatal
fn log_failure(err: DfsError) -> DfsError {
    match err {
        DfsError::RecoveryLog(_) => err,
        other => DfsError::RecoveryLog(other.to_string()),
    }
}

/// Route a request to its handler
pub fn dispatch(services: &Services, request: Request, sink: &dyn ResponseSink) -> Result<()> {
    match request {
        Request::NewTxn { file_name } => handle_new_txn(services, &file_name, sink),
        Request::Read { file_name } => handle_read(services, &file_name, sink),
        Request::Write { txn_id, seq, data } => handle_write(services, txn_id, seq, data, sink),
        Request::Commit { txn_id, seq } => handle_commit(services, txn_id, seq, sink),
        Request::Abort { txn_id } => handle_abort(services, txn_id, sink),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_dispatch_routes_every_verb() {
        let h = Harness::new();
        let sink = ResponseBuffer::new();

        dispatch(&h.services, Request::NewTxn { file_name: "d.txt".into() }, &sink).unwrap();
        let txn_id = match sink.take().as_slice() {
            [Response::Ack { txn_id, seq: 0 }] => *txn_id,
            other => panic!("unexpected: {:?}", other),
        };

        dispatch(&h.services, Request::Write { txn_id, seq: 1, data: b"x".to_vec() }, &sink).unwrap();
        assert!(sink.is_empty());

        dispatch(&h.services, Request::Commit { txn_id, seq: 1 }, &sink).unwrap();
        assert_eq!(sink.take(), vec![Response::Ack { txn_id, seq: 1 }]);

        dispatch(&h.services, Request::Read { file_name: "d.txt".into() }, &sink).unwrap();
        assert_eq!(sink.take(), vec![Response::ReadReply { data: b"x".to_vec() }]);

        dispatch(&h.services, Request::Abort { txn_id }, &sink).unwrap();
        match sink.take().as_slice() {
            [Response::Error { code, .. }] => assert_eq!(*code, ErrorCode::InvalidOperation),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_response_buffer_take_drains() {
        let sink = ResponseBuffer::new();
        sink.send(Response::Ack { txn_id: 1, seq: 1 });
        sink.send(Response::AskResend { txn_id: 1, seq: 2 });
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }
}
