//! MiniDFS - A minimal transactional file server
//!
//! Clients open a transaction for one file, stream it as numbered WRITE
//! fragments, and COMMIT once every fragment has been sent. The server asks
//! for any missing fragment, writes the assembled file durably, and only then
//! records the commit in a write-ahead recovery log.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Clients                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Protocol Handler                          │
//! │        (frame codec, one task per connection)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Request Handlers                          │
//! │     (NEW_TXN, WRITE, COMMIT, ABORT, READ, expiry)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    ┌─────────┴─────────┐
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │   Transaction Manager    │ │      Durable Store             │
//! │  (registry, recovery log)│ │  (atomic file writes)          │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                    │                   │
//!                    └─────────┬─────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     File System                             │
//! │            (recovery log, committed files)                  │
//! └─────────────────────────────────────────────────────────────┘

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use log::{error, info};

pub mod error;
pub mod handler;
pub mod protocol;
pub mod store;
pub mod txn;

use crate::error::Result;
use crate::handler::Services;
use crate::protocol::ConnectionHandler;
use crate::store::DiskStore;
use crate::txn::{FileRecoveryLog, RecoveryLog, RecoveryLogConfig, RecoveryManager, TransactionManager};

/// File name of the recovery log inside `Config::log_dir`
pub const RECOVERY_LOG_FILE: &str = "recovery.log";

/// Server configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Directory committed files are written into
    pub data_dir: PathBuf,
    /// Directory holding the recovery log
    pub log_dir: PathBuf,
    /// Recovery log batching and fsync policy
    pub wal: RecoveryLogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7896".parse().expect("invalid default bind address"),
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./log"),
            wal: RecoveryLogConfig::default(),
        }
    }
}

impl Config {
    pub fn recovery_log_path(&self) -> PathBuf {
        self.log_dir.join(RECOVERY_LOG_FILE)
    }
}

/// The file server
pub struct Server {
    config: Config,
    services: Services,
}

impl Server {
    /// Create a server, replaying the recovery log first
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.log_dir)?;

        let log_path = config.recovery_log_path();
        let recovered = RecoveryManager::new(log_path.clone()).recover()?;

        let log = FileRecoveryLog::open(log_path, config.wal.clone(), recovered.next_lsn)?;
        let manager = TransactionManager::from_recovered(recovered);
        // Clients must never reach the log, even when it lives under the data root
        let store = DiskStore::new(config.data_dir.canonicalize()?)
            .reserve(config.log_dir.canonicalize()?);

        let services = Services::new(
            Arc::new(manager),
            Arc::new(log) as Arc<dyn RecoveryLog>,
            Arc::new(store),
        );

        Ok(Self { config, services })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared services, for embedding and tests
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("MiniDFS server listening on {}", self.config.bind_addr);
        info!("Data directory: {:?}", self.config.data_dir);
        info!("Log directory: {:?}", self.config.log_dir);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    // Responses are small; don't let Nagle hold them back
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }

                    let services = self.services.clone();

                    tokio::spawn(async move {
                        let handler = ConnectionHandler::new(stream, services);
                        if let Err(e) = handler.run().await {
                            if e.is_fatal() {
                                error!("Fatal error on connection {}: {}", addr, e);
                                error!("Committed data may not be recoverable, shutting down");
                                std::process::abort();
                            }
                            error!("Connection error from {}: {}", addr, e);
                        }
                        info!("Connection closed: {}", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
