//! COMMIT handling
//!
//! A commit is evaluated entirely under the transaction's lock:
//! 1. Terminal status short-circuits (duplicate COMMIT re-acks, aborted or
//!    expired transactions get an error)
//! 2. Gap check: any missing fragment defers the commit and asks for resends
//! 3. Durable file write
//! 4. COMMIT record appended to the recovery log, strictly after step 3
//! 5. Status set to COMMITTED and the client acknowledged
//!
//! A failed file write leaves the transaction ACTIVE with nothing logged, so
//! the client can retry. A failed log append after a successful write is
//! returned as a fatal error and never acknowledged.

use crate::error::{ErrorCode, Result};
use crate::protocol::{Response, MAX_FRAGMENTS};
use crate::txn::{LogOperation, SeqNo, Transaction, TxnId, TxnState, TxnStatus};
use super::{log_failure, ResponseSink, Services};

/// Handle COMMIT(txn_id, seq). Produces exactly one ACK, one ERROR, or one
/// burst of ASK_RESEND responses.
pub fn handle_commit(
    services: &Services,
    txn_id: TxnId,
    seq: SeqNo,
    sink: &dyn ResponseSink,
) -> Result<()> {
    let Some(txn) = services.manager.lookup(txn_id) else {
        log::warn!("COMMIT for unknown transaction {}", txn_id);
        sink.send(Response::error(
            txn_id,
            ErrorCode::InvalidTransactionId,
            format!(
                "Transaction with ID ({}) does not exist. Commit could not be executed.",
                txn_id
            ),
        ));
        return Ok(());
    };

    if seq > MAX_FRAGMENTS {
        log::warn!("COMMIT({}, {}) exceeds the fragment limit", txn_id, seq);
        sink.send(Response::error(
            txn_id,
            ErrorCode::WrongMessageFormat,
            format!(
                "COMMIT names {} fragments; a transaction holds at most {}",
                seq, MAX_FRAGMENTS
            ),
        ));
        return Ok(());
    }

    let mut state = txn.lock();
    evaluate_commit(services, &txn, &mut state, seq, sink)
}

/// Evaluate a commit for a transaction whose lock the caller holds.
///
/// Also used by the WRITE handler to complete a deferred commit once the
/// last missing fragment arrives.
pub(super) fn evaluate_commit(
    services: &Services,
    txn: &Transaction,
    state: &mut TxnState,
    seq: SeqNo,
    sink: &dyn ResponseSink,
) -> Result<()> {
    let txn_id = txn.id();

    match state.status() {
        TxnStatus::Committed => {
            // The client lost our ACK; answer again without touching disk or log
            log::debug!("Duplicate COMMIT for transaction {}, re-sending ACK", txn_id);
            sink.send(Response::Ack { txn_id, seq });
            return Ok(());
        }
        TxnStatus::Aborted => {
            sink.send(Response::error(
                txn_id,
                ErrorCode::InvalidOperation,
                format!(
                    "Transaction with ID ({}) was aborted and so it cannot be committed",
                    txn_id
                ),
            ));
            return Ok(());
        }
        TxnStatus::TimerExpired => {
            sink.send(Response::error(
                txn_id,
                ErrorCode::InvalidOperation,
                format!(
                    "Transaction with ID ({}) timed out, so it cannot be committed",
                    txn_id
                ),
            ));
            return Ok(());
        }
        TxnStatus::Active => {}
    }

    let missing = state.missing_sequence_numbers(seq);
    if !missing.is_empty() {
        state.set_pending_commit(seq);
        log::debug!(
            "COMMIT({}, {}) deferred, asking for {} missing fragments",
            txn_id,
            seq,
            missing.len()
        );
        for missing_seq in missing {
            sink.send(Response::AskResend {
                txn_id,
                seq: missing_seq,
            });
        }
        return Ok(());
    }

    let data = state.assemble(seq);
    if let Err(e) = services.store.write_file(txn.file_name(), &data) {
        let code = ErrorCode::from_io(&e);
        log::error!(
            "Transaction {}: writing '{}' failed: {}",
            txn_id,
            txn.file_name(),
            e
        );
        let message = match code {
            ErrorCode::FileNotFound => format!(
                "Error writing \"{}\" to disk because the file could not be found. \
                 The directory may not exist or the server may lack permission to write to it. \
                 Diagnostic message: {}",
                txn.file_name(),
                e
            ),
            _ => format!("could not write \"{}\" to disk because: {}", txn.file_name(), e),
        };
        sink.send(Response::error(txn_id, code, message));
        return Ok(());
    }

    if let Err(e) = services.log.append_durable(txn_id, seq, LogOperation::Commit) {
        log::error!(
            "Transaction {}: '{}' is on disk but the COMMIT record could not be logged: {}",
            txn_id,
            txn.file_name(),
            e
        );
        return Err(log_failure(e));
    }

    state.transition(TxnStatus::Committed);
    log::info!(
        "Transaction {} committed: {} fragments, {} bytes to '{}'",
        txn_id,
        seq,
        data.len(),
        txn.file_name()
    );
    sink.send(Response::Ack { txn_id, seq });
    Ok(())
}
