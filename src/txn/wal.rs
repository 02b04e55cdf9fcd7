//! Recovery log - append-only, durable record of protocol events
//!
//! Every transaction event (creation, fragment write, commit, abort, expiry)
//! is appended here so that transaction outcomes can be rebuilt after a crash.
//! Records are never rewritten or deleted.
//!
//! ## On-disk format
//! Each record is bincode-encoded and prefixed with its length:
//! ```text
//! +----------------------+--------------------------+
//! | 4 bytes (LE u32)     | N bytes                  |
//! | Record length N      | bincode(LogRecord)       |
//! +----------------------+--------------------------+
//! ```
//!
//! ## Deferred fsync with commit latches
//!
//! A dedicated writer thread owns the file:
//! - Appends are batched and written to the OS buffer immediately
//! - Fsyncs happen periodically (every `fsync_interval_ms`) or when enough
//!   unsynced bytes have piled up
//! - Durable appends (COMMIT, ABORT, NEW_TXN) wait on a commit latch until the
//!   fsync covering their LSN completes, so many commits share one fsync
//!
//! LSNs are assigned by the writer thread in file order, so "durable up to
//! LSN n" always means every earlier record is durable too.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DfsError, Result};
use super::log::{LogOperation, LogRecord};
use super::types::{Lsn, SeqNo, TxnId};

/// How long a durable append waits for its fsync before giving up
const DURABLE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the writer blocks for new work when nothing is waiting on an fsync
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Append-only recovery log.
///
/// Implementations must write each record atomically with respect to other
/// appends, and `append_durable` must not return `Ok` before the record would
/// survive a crash.
pub trait RecoveryLog: Send + Sync {
    /// Append a record without waiting for it to reach stable storage
    fn append(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn>;

    /// Append a record and wait until it is durable
    fn append_durable(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn>;
}

/// Configuration for the log writer's batching and deferred fsync behavior.
///
/// # Presets
///
/// - [`RecoveryLogConfig::default()`] - Balanced (20ms fsync interval)
/// - [`RecoveryLogConfig::synchronous()`] - fsync every batch, lowest latency per commit
/// - [`RecoveryLogConfig::high_throughput()`] - Larger batches, higher latency
#[derive(Debug, Clone)]
pub struct RecoveryLogConfig {
    /// Maximum time to wait before flushing a batch (milliseconds)
    pub batch_timeout_ms: u64,
    /// Maximum number of records in a batch before forcing flush
    pub max_batch_size: usize,
    /// How often to fsync the log file (milliseconds). 0 means fsync every batch.
    pub fsync_interval_ms: u64,
    /// Maximum bytes to buffer before forcing an immediate fsync
    pub max_unfsynced_bytes: usize,
}

impl Default for RecoveryLogConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 2,
            max_batch_size: 128,
            fsync_interval_ms: 20,
            max_unfsynced_bytes: 1 << 20, // 1 MB
        }
    }
}

impl RecoveryLogConfig {
    /// fsync after every batch
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            batch_timeout_ms: 10,
            max_batch_size: 512,
            fsync_interval_ms: 100,
            max_unfsynced_bytes: 4 << 20, // 4 MB
        }
    }
}

/// Shared state for commit latches
pub(crate) struct FsyncState {
    /// Highest LSN durably fsynced
    durable_lsn: AtomicU64,
    /// Highest LSN written to the OS buffer
    written_lsn: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicBool,
    /// Set once a write or fsync failed; the log accepts nothing afterwards
    failed: AtomicBool,
}

impl FsyncState {
    fn new(durable_lsn: Lsn) -> Self {
        Self {
            durable_lsn: AtomicU64::new(durable_lsn),
            written_lsn: AtomicU64::new(durable_lsn),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn written_lsn(&self) -> Lsn {
        self.written_lsn.load(Ordering::Acquire)
    }

    /// Block until `target_lsn` is durable
    pub(crate) fn wait_for_durable(&self, target_lsn: Lsn, timeout: Duration) -> Result<()> {
        if self.durable_lsn() >= target_lsn {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .mutex
            .lock()
            .map_err(|_| DfsError::RecoveryLog("fsync state mutex poisoned".into()))?;

        loop {
            if self.durable_lsn() >= target_lsn {
                return Ok(());
            }
            if self.failed.load(Ordering::Acquire) {
                return Err(DfsError::RecoveryLog(format!(
                    "fsync failed before LSN {} became durable",
                    target_lsn
                )));
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(DfsError::RecoveryLog(
                    "log writer shut down during wait".into(),
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DfsError::RecoveryLog(format!(
                    "Timeout waiting for LSN {} to become durable (current: {})",
                    target_lsn,
                    self.durable_lsn()
                )));
            }

            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| DfsError::RecoveryLog("fsync state condvar wait failed".into()))?
                .0;
        }
    }

    fn signal_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn update_written(&self, lsn: Lsn) {
        self.written_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    fn signal_failure(&self) {
        self.failed.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// A request to append one record
struct AppendRequest {
    txn_id: TxnId,
    seq: SeqNo,
    op: LogOperation,
    responder: mpsc::SyncSender<Result<Lsn>>,
}

/// Control messages for the log writer thread
enum LogMessage {
    Append(AppendRequest),
    /// Force an immediate fsync; replies with the durable LSN
    ForceSync(mpsc::SyncSender<Result<Lsn>>),
    Shutdown,
}

/// File-backed recovery log with a dedicated writer thread
pub struct FileRecoveryLog {
    path: PathBuf,
    sender: mpsc::SyncSender<LogMessage>,
    fsync_state: Arc<FsyncState>,
    worker: Option<JoinHandle<()>>,
}

impl FileRecoveryLog {
    /// Open (or create) the log at `path` in append mode.
    ///
    /// `next_lsn` is the LSN the first new record receives; after a restart it
    /// comes from recovery so LSNs keep increasing across runs.
    pub fn open(path: impl Into<PathBuf>, config: RecoveryLogConfig, next_lsn: Lsn) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let next_lsn = next_lsn.max(1);
        let (tx, rx) = mpsc::sync_channel::<LogMessage>(10_000);
        let fsync_state = Arc::new(FsyncState::new(next_lsn - 1));

        let state = Arc::clone(&fsync_state);
        let worker = std::thread::Builder::new()
            .name("recovery-log".into())
            .spawn(move || log_writer_thread(file, rx, config, state, next_lsn))?;

        log::info!("Recovery log opened at {} (next LSN {})", path.display(), next_lsn);

        Ok(Self {
            path,
            sender: tx,
            fsync_state,
            worker: Some(worker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest LSN known to be on stable storage
    pub fn durable_lsn(&self) -> Lsn {
        self.fsync_state.durable_lsn()
    }

    /// Force an immediate fsync and return the durable LSN
    pub fn force_sync(&self) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::ForceSync(tx))
            .map_err(|e| DfsError::RecoveryLog(format!("log writer channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| DfsError::RecoveryLog(format!("force sync response lost: {}", e)))?
    }

    /// Hand a record to the writer and wait until it is in the OS buffer
    fn submit(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        let req = AppendRequest {
            txn_id,
            seq,
            op,
            responder: tx,
        };
        self.sender
            .send(LogMessage::Append(req))
            .map_err(|e| DfsError::RecoveryLog(format!("log writer channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| DfsError::RecoveryLog(format!("log writer response lost: {}", e)))?
    }
}

impl RecoveryLog for FileRecoveryLog {
    fn append(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn> {
        self.submit(txn_id, seq, op)
    }

    fn append_durable(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn> {
        let lsn = self.submit(txn_id, seq, op)?;
        self.fsync_state.wait_for_durable(lsn, DURABLE_WAIT_TIMEOUT)?;
        Ok(lsn)
    }
}

impl Drop for FileRecoveryLog {
    fn drop(&mut self) {
        let _ = self.sender.send(LogMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Recovery log writer thread panicked");
            }
        }
    }
}

/// Log writer thread - batches appends and performs deferred fsync
fn log_writer_thread(
    mut file: File,
    rx: mpsc::Receiver<LogMessage>,
    config: RecoveryLogConfig,
    fsync_state: Arc<FsyncState>,
    mut next_lsn: Lsn,
) {
    let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred_fsync = config.fsync_interval_ms > 0;

    let mut last_fsync = Instant::now();
    let mut unfsynced_bytes: usize = 0;
    let mut max_written_lsn: Lsn = next_lsn - 1;
    let mut failed = false;

    loop {
        let mut batch: Vec<AppendRequest> = Vec::new();
        let mut pending_syncs: Vec<mpsc::SyncSender<Result<Lsn>>> = Vec::new();
        let mut should_shutdown = false;

        let recv_timeout = if deferred_fsync && unfsynced_bytes > 0 {
            batch_timeout.min(fsync_interval.saturating_sub(last_fsync.elapsed()))
        } else {
            IDLE_POLL_INTERVAL
        };

        match rx.recv_timeout(recv_timeout) {
            Ok(LogMessage::Append(req)) => batch.push(req),
            Ok(LogMessage::ForceSync(responder)) => pending_syncs.push(responder),
            Ok(LogMessage::Shutdown) => should_shutdown = true,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => should_shutdown = true,
        }

        // Gather more appends until the batch window closes
        let deadline = Instant::now() + batch_timeout;
        while !batch.is_empty() && batch.len() < config.max_batch_size && !should_shutdown {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(LogMessage::Append(req)) => batch.push(req),
                Ok(LogMessage::ForceSync(responder)) => pending_syncs.push(responder),
                Ok(LogMessage::Shutdown) => should_shutdown = true,
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => should_shutdown = true,
            }
        }

        if !batch.is_empty() {
            if failed {
                for req in batch.drain(..) {
                    let _ = req
                        .responder
                        .send(Err(DfsError::RecoveryLog("recovery log is unusable after an earlier failure".into())));
                }
            } else {
                let mut records = Vec::with_capacity(batch.len());
                let mut responders = Vec::with_capacity(batch.len());
                for req in batch.drain(..) {
                    records.push(LogRecord::new(next_lsn, req.txn_id, req.seq, req.op));
                    responders.push((next_lsn, req.responder));
                    next_lsn += 1;
                }

                let result = write_records(&mut file, &records).and_then(|bytes| {
                    if deferred_fsync {
                        Ok(bytes)
                    } else {
                        file.sync_data()?;
                        Ok(0)
                    }
                });

                match result {
                    Ok(bytes) => {
                        max_written_lsn = next_lsn - 1;
                        fsync_state.update_written(max_written_lsn);
                        if deferred_fsync {
                            unfsynced_bytes += bytes;
                        } else {
                            fsync_state.signal_durable(max_written_lsn);
                            last_fsync = Instant::now();
                        }
                        if records.len() > 1 {
                            log::debug!("Recovery log batch written: {} records", records.len());
                        }
                        for (lsn, responder) in responders {
                            let _ = responder.send(Ok(lsn));
                        }
                    }
                    Err(e) => {
                        log::error!("Recovery log write failed: {}", e);
                        failed = true;
                        fsync_state.signal_failure();
                        let msg = e.to_string();
                        for (_, responder) in responders {
                            let _ = responder.send(Err(DfsError::RecoveryLog(msg.clone())));
                        }
                    }
                }
            }
        }

        let force_requested = !pending_syncs.is_empty();
        let time_triggered = deferred_fsync && last_fsync.elapsed() >= fsync_interval;
        let size_triggered = unfsynced_bytes >= config.max_unfsynced_bytes;

        if !failed
            && unfsynced_bytes > 0
            && (time_triggered || size_triggered || force_requested || should_shutdown)
        {
            match file.sync_data() {
                Ok(()) => {
                    fsync_state.signal_durable(max_written_lsn);
                    log::debug!(
                        "Recovery log fsync complete: LSN {}, {} bytes",
                        max_written_lsn,
                        unfsynced_bytes
                    );
                    unfsynced_bytes = 0;
                    last_fsync = Instant::now();
                }
                Err(e) => {
                    log::error!("Recovery log fsync failed: {}", e);
                    failed = true;
                    fsync_state.signal_failure();
                }
            }
        }

        for responder in pending_syncs {
            let reply = if failed {
                Err(DfsError::RecoveryLog("recovery log fsync failed".into()))
            } else {
                Ok(fsync_state.durable_lsn())
            };
            let _ = responder.send(reply);
        }

        if should_shutdown {
            fsync_state.signal_shutdown();
            log::info!("Recovery log writer shutting down");
            break;
        }
    }
}

/// Write a batch of length-prefixed records to the OS buffer.
/// Returns the number of bytes written.
pub(super) fn write_records(file: &mut File, records: &[LogRecord]) -> std::io::Result<usize> {
    // Encode the whole batch first so a record is never half-written because
    // of an encoding error.
    let mut buf = Vec::new();
    for record in records {
        let encoded = bincode::serialize(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&encoded);
    }
    file.write_all(&buf)?;
    file.flush()?;
    Ok(buf.len())
}

/// In-memory recovery log.
///
/// Keeps records in append order; useful for embedding and tests where
/// crash durability is not needed.
#[derive(Debug, Default)]
pub struct MemoryRecoveryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryRecoveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in append order
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("memory log lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("memory log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecoveryLog for MemoryRecoveryLog {
    fn append(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn> {
        let mut records = self.records.lock().expect("memory log lock poisoned");
        let lsn = records.len() as Lsn + 1;
        records.push(LogRecord::new(lsn, txn_id, seq, op));
        Ok(lsn)
    }

    fn append_durable(&self, txn_id: TxnId, seq: SeqNo, op: LogOperation) -> Result<Lsn> {
        self.append(txn_id, seq, op)
    }
}
