//! `urja dev`: serve the project with on-demand transforms and HMR.

use super::load_config;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use urja_core::config::ServerConfig;
use urja_core::{default_engine, DevServer};

#[derive(Debug, Clone)]
pub struct DevAction {
    /// Config file path.
    pub config: PathBuf,
    pub port: Option<u16>,
    pub host: Option<String>,
    /// Run the file watcher.
    pub watch: bool,
}

pub async fn run(action: DevAction) -> Result<()> {
    let mut config = load_config(&action.config)?;
    if action.port.is_some() || action.host.is_some() {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        if action.port.is_some() {
            server.port = action.port;
        }
        if action.host.is_some() {
            server.host = action.host;
        }
    }

    let server = DevServer::new(config, default_engine())
        .watch(action.watch)
        .start()
        .await
        .into_diagnostic()?;

    println!("  urja dev server running at http://{}", server.local_addr());
    let deps = server.prebundle().entries().count();
    if deps > 0 {
        println!("  {deps} dependencies pre-bundled");
    }

    tokio::select! {
        result = server.wait() => result.into_diagnostic(),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
