//! MapSync server: authority of record for shared feature collections.
//!
//! Serves `/api/sync` (pull / push / ping) and `/api/poke` over WebSocket,
//! backed by RocksDB when a storage path is given.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;
use mapsync_collab::{ServerConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "mapsync-server", version, about)]
struct Cli {
    /// TOML file with a `ServerConfig`; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory. Without it documents live in memory only.
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Seconds between pings on idle poke sockets.
    #[arg(long)]
    heartbeat: Option<u64>,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(storage) = &self.storage {
            config.storage_path = Some(storage.clone());
        }
        if let Some(secs) = self.heartbeat {
            config.heartbeat_interval_secs = secs;
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<ServerConfig, Box<dyn Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let config = toml::from_str(&raw)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.server_config()?;
    match &config.storage_path {
        Some(path) => info!("Persisting documents under {}", path.display()),
        None => info!("No storage path given; documents are kept in memory"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let server = SyncServer::new(config)?;
    runtime.block_on(server.run())
}

fn main() {
    env_logger::init();
    info!("Starting MapSync server...");

    if let Err(e) = run(Cli::parse()) {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "mapsync-server",
            "--bind",
            "0.0.0.0:7000",
            "--storage",
            "/tmp/mapsync",
        ]);
        let config = cli.server_config().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/mapsync")));
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_toml_config_is_partial() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_addr = "127.0.0.1:9999"

            [authority]
            dedup_window = 128
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9999");
        assert_eq!(config.authority.dedup_window, 128);
        assert_eq!(config.authority.compact_every, 1024);
        assert!(config.storage_path.is_none());
    }
}
