//! tbmux: multiplexing proxy for the Telegram Bot API.
//!
//! Holds the single upstream long-poll session, persists every update into a
//! local log, and lets multiple downstream bot processes share the one bot
//! identity through independent update cursors.

mod bootstrap_helpers;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tbmux_runtime::cooldown::CooldownTracker;
use tbmux_runtime::poller::{PollerConfig, UpdatePoller};
use tbmux_runtime::server::{run_server, ProxyState, ServerConfig};
use tbmux_store::UpdateStore;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(
    name = "tbmux",
    about = "Multiplexing proxy for the Telegram Bot API",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "TBMUX_CONFIG",
        default_value = "tbmux.toml",
        help = "Path to the TOML configuration file"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap_helpers::init_tracing();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store = Arc::new(
        UpdateStore::open(&config.db)
            .with_context(|| format!("failed to open update store '{}'", config.db))?,
    );
    let cooldowns = Arc::new(CooldownTracker::new());
    info!("update store ready: db={}", config.db);

    let poller = UpdatePoller::new(
        PollerConfig {
            api_prefix: config.upstream_api_prefix(),
            polling_timeout: config.upstream.polling_timeout,
            filter_update_types: config.filter_update_types_json()?,
            max_retry_interval: Duration::from_secs(config.upstream.max_retry_interval),
        },
        Arc::clone(&store),
    )?;

    let state = Arc::new(ProxyState::new(
        ServerConfig {
            listen_addr: config.downstream.listen_addr.clone(),
            api_path: config.downstream.api_path.clone(),
            file_path: config.downstream.file_path.clone(),
            downstream_token: config.downstream.auth_token.clone(),
            upstream_api_prefix: config.upstream_api_prefix(),
            upstream_file_prefix: config.upstream_file_prefix(),
        },
        Arc::clone(&store),
        Arc::clone(&cooldowns),
    )?);

    // The poller only returns on a fatal upstream rejection; the server only
    // returns after ctrl-c. Whichever finishes first ends the process.
    tokio::select! {
        result = poller.run() => result.context("upstream polling terminated"),
        result = run_server(state) => result,
    }
}
