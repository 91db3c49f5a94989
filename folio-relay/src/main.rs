//! Folio relay: stateless-from-the-client's-view WebSocket relay.
//!
//! Usage: `folio-relay [config.toml]`. Without a file the relay binds
//! `127.0.0.1:9090` and keeps rooms in memory only.

use std::process::ExitCode;

use folio_collab::server::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_toml_file(&path) {
            Ok(config) => {
                info!("Loaded relay config from {path}");
                config
            }
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(store) = server.store() {
        info!("Persisting rooms under {}", store.path().display());
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    ExitCode::SUCCESS
}
