use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use sshlure::cli::{Cli, Command};
use sshlure::config::{self, ConfigStore, Snapshot};
use sshlure::ssh::keys;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = config::read_config_text(cli.config.as_deref())?;

    if let Some(Command::CheckConfig) = &cli.command {
        let snapshot = Snapshot::build(&raw, &cli.data_dir).context("invalid configuration")?;
        println!("Configuration is valid.");
        for addr in &snapshot.listen_addresses {
            println!("  SSH listen: {}", addr);
        }
        for key in &snapshot.ssh.keys {
            println!("  Host key: {}", keys::host_key_fingerprint(key));
        }
        println!("  Auth policy: {}", snapshot.config.auth.policy);
        println!("  Match mode: {}", snapshot.config.shell.match_mode);
        println!("  Commands: {}", snapshot.config.shell.commands.len());
        return Ok(());
    }

    // Parse once up front so logging honours the file's settings.
    let app_config = config::parse_config(&raw)?;
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.logging.level.to_string());
    sshlure::logging::setup_logging(&log_level, app_config.logging.format);

    // Run the async server
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = match ConfigStore::from_text(&raw, &cli.data_dir) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Invalid configuration");
                std::process::exit(1);
            }
        };
        info!(
            version = env!("CARGO_PKG_VERSION"),
            listen = ?store.current().listen_addresses,
            "Starting sshlure"
        );
        if let Err(e) = sshlure::server::run(store, cli.config.clone()).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}
