//! Protocol message types
//!
//! Every verb is a variant of a closed enum; the dispatcher matches on it
//! exhaustively.

use std::fmt;

use crate::error::ErrorCode;
use crate::txn::{SeqNo, TxnId};

/// Protocol method names as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    NewTxn,
    Read,
    Write,
    Commit,
    Abort,
    Ack,
    AskResend,
    Error,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::NewTxn => "NEW_TXN",
            Method::Read => "READ",
            Method::Write => "WRITE",
            Method::Commit => "COMMIT",
            Method::Abort => "ABORT",
            Method::Ack => "ACK",
            Method::AskResend => "ASK_RESEND",
            Method::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW_TXN" => Some(Method::NewTxn),
            "READ" => Some(Method::Read),
            "WRITE" => Some(Method::Write),
            "COMMIT" => Some(Method::Commit),
            "ABORT" => Some(Method::Abort),
            "ACK" => Some(Method::Ack),
            "ASK_RESEND" => Some(Method::AskResend),
            "ERROR" => Some(Method::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a transaction that will write `file_name`
    NewTxn { file_name: String },
    /// Fetch a committed file
    Read { file_name: String },
    /// One numbered fragment of file data
    Write { txn_id: TxnId, seq: SeqNo, data: Vec<u8> },
    /// Client asserts fragments `1..=seq` have been sent
    Commit { txn_id: TxnId, seq: SeqNo },
    Abort { txn_id: TxnId },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::NewTxn { .. } => Method::NewTxn,
            Request::Read { .. } => Method::Read,
            Request::Write { .. } => Method::Write,
            Request::Commit { .. } => Method::Commit,
            Request::Abort { .. } => Method::Abort,
        }
    }

    /// Transaction the request refers to; 0 for requests outside a transaction
    pub fn txn_id(&self) -> TxnId {
        match self {
            Request::NewTxn { .. } | Request::Read { .. } => 0,
            Request::Write { txn_id, .. }
            | Request::Commit { txn_id, .. }
            | Request::Abort { txn_id } => *txn_id,
        }
    }
}

/// A response to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Confirms NEW_TXN, COMMIT (first time or duplicate), or ABORT
    Ack { txn_id: TxnId, seq: SeqNo },
    /// Asks the client to resend one missing fragment
    AskResend { txn_id: TxnId, seq: SeqNo },
    Error {
        txn_id: TxnId,
        code: ErrorCode,
        message: String,
    },
    /// Contents of a file requested with READ
    ReadReply { data: Vec<u8> },
}

impl Response {
    pub fn error(txn_id: TxnId, code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            txn_id,
            code,
            message: message.into(),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Response::Ack { .. } => Method::Ack,
            Response::AskResend { .. } => Method::AskResend,
            Response::Error { .. } => Method::Error,
            Response::ReadReply { .. } => Method::Read,
        }
    }
}
