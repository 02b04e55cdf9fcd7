//! Recovery log replay
//!
//! Reads the recovery log written by [`FileRecoveryLog`](super::FileRecoveryLog)
//! and rebuilds the outcome of every transaction it mentions. Replay never
//! modifies the log.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::PathBuf;

use crate::error::Result;
use super::log::{LogOperation, LogRecord};
use super::types::{Lsn, SeqNo, TxnId, TxnStatus};

/// What the log says about one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTxn {
    pub file_name: String,
    pub status: TxnStatus,
    /// Buffered fragments; only kept for transactions that are still ACTIVE
    pub fragments: BTreeMap<SeqNo, Vec<u8>>,
}

/// Result of replaying the recovery log
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub transactions: BTreeMap<TxnId, RecoveredTxn>,
    /// LSN to hand to the next appended record
    pub next_lsn: Lsn,
    /// Smallest transaction id not used by any logged transaction
    pub next_txn_id: TxnId,
}

impl RecoveredState {
    fn empty() -> Self {
        Self {
            transactions: BTreeMap::new(),
            next_lsn: 1,
            next_txn_id: 1,
        }
    }

    pub fn count_with_status(&self, status: TxnStatus) -> usize {
        self.transactions.values().filter(|t| t.status == status).count()
    }
}

/// Replays a recovery log file
pub struct RecoveryManager {
    log_path: PathBuf,
}

impl RecoveryManager {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Replay the log. A missing log file means a fresh start.
    pub fn recover(&self) -> Result<RecoveredState> {
        if !self.log_path.exists() {
            return Ok(RecoveredState::empty());
        }

        log::info!("Starting recovery from {}", self.log_path.display());

        let mut reader = BufReader::new(File::open(&self.log_path)?);
        let mut state = RecoveredState::empty();
        let mut max_lsn: Lsn = 0;
        let mut max_txn_id: TxnId = 0;
        let mut orphans: HashMap<TxnId, usize> = HashMap::new();

        while let Some(record) = read_record(&mut reader)? {
            max_lsn = max_lsn.max(record.lsn);
            max_txn_id = max_txn_id.max(record.txn_id);

            if let LogOperation::NewTxn { file_name } = &record.op {
                state.transactions.entry(record.txn_id).or_insert_with(|| RecoveredTxn {
                    file_name: file_name.clone(),
                    status: TxnStatus::Active,
                    fragments: BTreeMap::new(),
                });
                continue;
            }

            let Some(txn) = state.transactions.get_mut(&record.txn_id) else {
                *orphans.entry(record.txn_id).or_default() += 1;
                continue;
            };

            // Events after a terminal record cannot change the outcome
            if txn.status.is_terminal() {
                continue;
            }

            match record.op {
                LogOperation::Write { data } => {
                    txn.fragments.entry(record.seq).or_insert(data);
                }
                LogOperation::Commit => txn.status = TxnStatus::Committed,
                LogOperation::Abort => txn.status = TxnStatus::Aborted,
                LogOperation::TimerExpired => txn.status = TxnStatus::TimerExpired,
                LogOperation::NewTxn { .. } => {}
            }
        }

        // Committed and abandoned transactions don't need their bytes any more
        for txn in state.transactions.values_mut() {
            if txn.status.is_terminal() {
                txn.fragments.clear();
            }
        }

        for (txn_id, count) in &orphans {
            log::warn!("Ignored {} log records for unknown transaction {}", count, txn_id);
        }

        state.next_lsn = max_lsn + 1;
        state.next_txn_id = max_txn_id + 1;

        log::info!(
            "Recovery complete: {} committed, {} aborted, {} expired, {} active. Next LSN: {}, Next TxnId: {}",
            state.count_with_status(TxnStatus::Committed),
            state.count_with_status(TxnStatus::Aborted),
            state.count_with_status(TxnStatus::TimerExpired),
            state.count_with_status(TxnStatus::Active),
            state.next_lsn,
            state.next_txn_id
        );

        Ok(state)
    }
}

/// Read one length-prefixed record.
///
/// Returns `Ok(None)` at end of file, including when the final record was
/// torn by a crash mid-append. Records that fail to decode are skipped.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<LogRecord>> {
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut record_buf = vec![0u8; len];
        match reader.read_exact(&mut record_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::warn!("Recovery log ends with a torn record ({} bytes expected)", len);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        match bincode::deserialize::<LogRecord>(&record_buf) {
            Ok(record) => return Ok(Some(record)),
            Err(e) => log::warn!("Skipping malformed recovery log record: {}", e),
        }
    }
}
