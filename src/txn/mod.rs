//! Transaction engine - per-transaction state, registry, and recovery log

pub mod types;
pub mod log;
pub mod wal;
pub mod recovery;
pub mod manager;

// Public API
pub use types::{Lsn, SeqNo, Transaction, TxnId, TxnState, TxnStatus};
pub use log::{LogOperation, LogRecord};
pub use wal::{FileRecoveryLog, MemoryRecoveryLog, RecoveryLog, RecoveryLogConfig};
pub use recovery::{RecoveredState, RecoveredTxn, RecoveryManager};
pub use manager::TransactionManager;
