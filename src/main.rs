//! MiniDFS server binary

use std::path::PathBuf;
use log::info;

use minidfs::txn::RecoveryLogConfig;
use minidfs::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    // Simple argument parsing
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port: u16 = args[i + 1].parse()?;
                    config.bind_addr = format!("127.0.0.1:{}", port).parse()?;
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--log-dir" | "-l" => {
                if i + 1 < args.len() {
                    config.log_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--sync" => {
                config.wal = RecoveryLogConfig::synchronous();
            }
            "--help" | "-h" => {
                println!("MiniDFS - A minimal transactional file server");
                println!();
                println!("Usage: minidfs [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -p, --port PORT       Port to listen on (default: 7896)");
                println!("  -d, --data-dir DIR    Directory for committed files (default: ./data)");
                println!("  -l, --log-dir DIR     Recovery log directory (default: ./log)");
                println!("      --sync            Fsync the recovery log on every batch");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            other => {
                log::warn!("Ignoring unknown argument '{}'", other);
            }
        }
        i += 1;
    }

    info!("Starting MiniDFS server...");

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
