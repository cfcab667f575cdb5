//! portfwd: TCP port-forwarding daemon.
//!
//! Reads forwarding rules from a TOML file, listens on every rule's port and
//! relays each connection to the rule's forward address until either side
//! closes or the idle timeout fires. Runs until SIGINT or SIGTERM.

mod config;
mod shutdown;

use anyhow::Context;
use clap::Parser;
use config::DaemonConfig;
use portfwd_core::{ConnectionHandler, IdleTimeout, ListenerManager, BIND_ALL};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const VERBOSE_LEVELS: &str = "Verbose levels:
  0: startup only
  1: typical errors
  2: connection flood
  3: timeout drops
  4: everything";

/// portfwd — TCP port forwarder
#[derive(Parser, Debug)]
#[command(
    name = "portfwd",
    version,
    about = "TCP port forwarder",
    after_help = VERBOSE_LEVELS
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose level (0-4)
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=4))]
    verbose: u8,

    /// Log filter directive; overrides --verbose (e.g. "portfwd_core=debug")
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn filter_directive(&self) -> String {
        match &self.log_level {
            Some(directive) => directive.clone(),
            None => verbosity_filter(self.verbose).to_string(),
        }
    }
}

/// Map the 0–4 verbose scale onto a tracing filter.
///
/// Startup messages stay visible at every level.
fn verbosity_filter(level: u8) -> &'static str {
    match level {
        0 => "off,portfwd=info,portfwd_core::listener=info",
        1 => "warn,portfwd=info,portfwd_core::listener=info",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        verbose = cli.verbose,
        "starting portfwd"
    );

    let accept_loops = match start(&cli.config).await {
        Ok(loops) => loops,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start");
            std::process::exit(1);
        }
    };

    info!(listeners = accept_loops.len(), "Ctrl + C to stop");
    shutdown::wait().await;
    info!("exiting");
}

/// Load the config, bind every listener, and spawn the accept loops.
///
/// Nothing is accepted unless every rule is valid and every port is bound.
async fn start(config_path: &Path) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let config = DaemonConfig::load(config_path).context("cannot read the config file")?;

    match config.idle_timeout {
        IdleTimeout::Disabled => info!("timeout disabled"),
        IdleTimeout::After(d) => debug!(timeout = ?d, "timeout set"),
    }
    if config.rules.is_empty() {
        warn!("no forwarding rules configured");
    }

    let handler = Arc::new(ConnectionHandler::new(
        Arc::new(config.rules),
        config.idle_timeout,
    ));
    let manager = ListenerManager::bind(handler, BIND_ALL)
        .await
        .context("cannot start listeners")?;

    Ok(manager.spawn())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_map_to_filters() {
        assert!(verbosity_filter(0).starts_with("off"));
        for level in 0..=1 {
            let filter = verbosity_filter(level);
            assert!(filter.contains("portfwd=info"), "{filter}");
            assert!(filter.contains("portfwd_core::listener=info"), "{filter}");
        }
        assert!(verbosity_filter(1).starts_with("warn"));
        assert_eq!(verbosity_filter(2), "info");
        assert_eq!(verbosity_filter(3), "debug");
        assert_eq!(verbosity_filter(4), "trace");
        for level in 0..=4 {
            assert!(tracing_subscriber::EnvFilter::try_new(verbosity_filter(level)).is_ok());
        }
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["portfwd"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("rules.toml"));
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.filter_directive(), verbosity_filter(1));
    }

    #[test]
    fn log_level_overrides_verbose() {
        let cli = Cli::try_parse_from(["portfwd", "-v", "4", "--log-level", "portfwd_core=debug"])
            .unwrap();
        assert_eq!(cli.filter_directive(), "portfwd_core=debug");
    }

    #[test]
    fn verbose_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["portfwd", "--verbose", "5"]).is_err());
    }

    #[tokio::test]
    async fn start_fails_on_invalid_rule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, "[[rules]]\nlisten = 0\nforward = \"127.0.0.1:1\"\n").unwrap();

        let err = start(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("does not have a valid port number"));
    }
}
