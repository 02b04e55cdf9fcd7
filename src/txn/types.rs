//! Core transaction types and state management

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Log Sequence Number - unique identifier for each recovery log record
pub type Lsn = u64;

/// Transaction ID
pub type TxnId = u64;

/// Fragment sequence number. Fragments are numbered contiguously from 1.
pub type SeqNo = u64;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
    TimerExpired,
}

impl TxnStatus {
    /// Terminal statuses have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxnStatus::Active => "ACTIVE",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::Aborted => "ABORTED",
            TxnStatus::TimerExpired => "TIMER_EXPIRED",
        }
    }
}

/// Mutable state of a transaction, only reachable through the transaction's lock
#[derive(Debug)]
pub struct TxnState {
    status: TxnStatus,
    /// Buffered fragment bytes keyed by sequence number. The key set is the
    /// set of received sequence numbers.
    fragments: BTreeMap<SeqNo, Vec<u8>>,
    /// Sequence count of a commit that arrived before all of its fragments
    pending_commit: Option<SeqNo>,
}

impl TxnState {
    pub fn new() -> Self {
        Self {
            status: TxnStatus::Active,
            fragments: BTreeMap::new(),
            pending_commit: None,
        }
    }

    /// Rebuild state from recovered log contents
    pub(crate) fn restored(status: TxnStatus, fragments: BTreeMap<SeqNo, Vec<u8>>) -> Self {
        Self {
            status,
            fragments,
            pending_commit: None,
        }
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Move out of ACTIVE, releasing the buffered fragments.
    ///
    /// Returns false, leaving the state untouched, if the transaction is
    /// already terminal or `to` is not a terminal status.
    pub fn transition(&mut self, to: TxnStatus) -> bool {
        if self.status.is_terminal() || !to.is_terminal() {
            return false;
        }
        self.status = to;
        self.pending_commit = None;
        self.fragments.clear();
        true
    }

    /// Buffer a fragment. Duplicates are absorbed: the first copy of a
    /// sequence number wins and later copies are ignored.
    ///
    /// Returns true if the sequence number was not seen before.
    pub fn record_fragment(&mut self, seq: SeqNo, data: Vec<u8>) -> bool {
        if self.fragments.contains_key(&seq) {
            return false;
        }
        self.fragments.insert(seq, data);
        true
    }

    pub fn has_fragment(&self, seq: SeqNo) -> bool {
        self.fragments.contains_key(&seq)
    }

    /// Received sequence numbers in ascending order
    pub fn received_sequence_numbers(&self) -> impl Iterator<Item = SeqNo> + '_ {
        self.fragments.keys().copied()
    }

    pub fn received_count(&self) -> usize {
        self.fragments.len()
    }

    /// The gap set: sequence numbers in `1..=seq` that have not been received,
    /// in ascending order.
    pub fn missing_sequence_numbers(&self, seq: SeqNo) -> Vec<SeqNo> {
        (1..=seq).filter(|n| !self.fragments.contains_key(n)).collect()
    }

    /// Concatenate fragments `1..=seq` in order.
    ///
    /// Callers check the gap set first; a missing fragment contributes nothing.
    pub fn assemble(&self, seq: SeqNo) -> Vec<u8> {
        let size = self.fragments.range(1..=seq).map(|(_, d)| d.len()).sum();
        let mut out = Vec::with_capacity(size);
        for (_, data) in self.fragments.range(1..=seq) {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn pending_commit(&self) -> Option<SeqNo> {
        self.pending_commit
    }

    /// Remember a deferred commit, superseding any earlier one
    pub fn set_pending_commit(&mut self, seq: SeqNo) {
        self.pending_commit = Some(seq);
    }

    pub fn clear_pending_commit(&mut self) {
        self.pending_commit = None;
    }
}

impl Default for TxnState {
    fn default() -> Self {
        Self::new()
    }
}

/// A file-write transaction.
///
/// The id and target file name are fixed at construction; everything else
/// lives behind the per-transaction lock.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    file_name: String,
    state: Mutex<TxnState>,
}

impl Transaction {
    pub fn new(id: TxnId, file_name: impl Into<String>) -> Self {
        Self::with_state(id, file_name, TxnState::new())
    }

    pub(crate) fn with_state(id: TxnId, file_name: impl Into<String>, state: TxnState) -> Self {
        Self {
            id,
            file_name: file_name.into(),
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Acquire the transaction's lock. The guard releases it on drop.
    pub fn lock(&self) -> MutexGuard<'_, TxnState> {
        self.state.lock().expect("transaction lock poisoned")
    }

    /// Snapshot of the current status (takes the lock briefly)
    pub fn status(&self) -> TxnStatus {
        self.lock().status()
    }
}
