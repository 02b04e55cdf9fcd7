//! Recovery log record structures

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::types::{Lsn, SeqNo, TxnId};

/// A recovery log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Transaction ID
    pub txn_id: TxnId,
    /// Fragment sequence number (fragment count for COMMIT, 0 when unused)
    pub seq: SeqNo,
    /// The operation
    pub op: LogOperation,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

impl LogRecord {
    pub fn new(lsn: Lsn, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Self {
        Self {
            lsn,
            txn_id,
            seq,
            op,
            timestamp: now_millis(),
        }
    }
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Transaction created for a target file
    NewTxn { file_name: String },
    /// Fragment buffered
    Write { data: Vec<u8> },
    /// File durably written and transaction committed
    Commit,
    /// Transaction aborted by the client
    Abort,
    /// Transaction timed out
    TimerExpired,
}

impl LogOperation {
    /// Protocol method the record was produced by
    pub fn method_tag(&self) -> &'static str {
        match self {
            LogOperation::NewTxn { .. } => "NEW_TXN",
            LogOperation::Write { .. } => "WRITE",
            LogOperation::Commit => "COMMIT",
            LogOperation::Abort => "ABORT",
            LogOperation::TimerExpired => "TIMER_EXPIRED",
        }
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}
