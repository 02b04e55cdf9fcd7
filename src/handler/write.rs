//! WRITE handling
//!
//! Fragments are buffered in memory and logged without waiting for fsync.
//! Successful writes are silent. If a COMMIT is waiting on missing fragments
//! and this write closes the last gap, the commit completes here.

use crate::error::{ErrorCode, Result};
use crate::protocol::{Response, MAX_FRAGMENTS};
use crate::txn::{LogOperation, SeqNo, TxnId, TxnStatus};
use super::commit::evaluate_commit;
use super::{ResponseSink, Services};

pub fn handle_write(
    services: &Services,
    txn_id: TxnId,
    seq: SeqNo,
    data: Vec<u8>,
    sink: &dyn ResponseSink,
) -> Result<()> {
    let Some(txn) = services.manager.lookup(txn_id) else {
        sink.send(Response::error(
            txn_id,
            ErrorCode::InvalidTransactionId,
            format!(
                "Transaction with ID ({}) does not exist. Write could not be executed.",
                txn_id
            ),
        ));
        return Ok(());
    };

    if seq == 0 {
        sink.send(Response::error(
            txn_id,
            ErrorCode::WrongMessageFormat,
            "WRITE sequence numbers start at 1",
        ));
        return Ok(());
    }
    if seq > MAX_FRAGMENTS {
        sink.send(Response::error(
            txn_id,
            ErrorCode::WrongMessageFormat,
            format!("WRITE sequence number {} exceeds the limit of {}", seq, MAX_FRAGMENTS),
        ));
        return Ok(());
    }

    let mut state = txn.lock();

    let status = state.status();
    if status != TxnStatus::Active {
        sink.send(Response::error(
            txn_id,
            ErrorCode::InvalidOperation,
            format!(
                "Transaction with ID ({}) is {} and no longer accepts writes",
                txn_id,
                status.as_str()
            ),
        ));
        return Ok(());
    }

    // Resent fragments are ignored: the first copy wins
    if state.has_fragment(seq) {
        log::debug!("Transaction {}: duplicate fragment {} ignored", txn_id, seq);
    } else {
        services.log.append(
            txn_id,
            seq,
            LogOperation::Write { data: data.clone() },
        )?;
        state.record_fragment(seq, data);
        log::trace!("Transaction {}: buffered fragment {}", txn_id, seq);
    }

    if let Some(pending) = state.pending_commit() {
        if seq <= pending && state.missing_sequence_numbers(pending).is_empty() {
            log::debug!(
                "Transaction {}: fragment {} closed the gap, completing COMMIT({})",
                txn_id,
                seq,
                pending
            );
            return evaluate_commit(services, &txn, &mut state, pending, sink);
        }
    }

    Ok(())
}
