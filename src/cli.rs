//! CLI argument parsing for upvisor
//!
//! Flags mirror the `DAEMON_*` environment variables used by existing
//! deployments; a flag wins over its environment fallback, and boolean
//! environment variables are enabled by the value "on".

use std::env;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, ConfigError};

/// upvisor - supervises a daemon binary and swaps it on self-reported upgrades
#[derive(Parser, Debug)]
#[command(name = "upvisor")]
#[command(about = "Supervises a daemon binary and swaps it on self-reported upgrades")]
#[command(version)]
pub struct Cli {
    /// Daemon home directory (falls back to $DAEMON_HOME)
    #[arg(long = "home")]
    pub home: Option<PathBuf>,

    /// Daemon binary name (falls back to $DAEMON_NAME)
    #[arg(long = "name")]
    pub name: Option<String>,

    /// Download missing upgrade binaries
    /// (falls back to $DAEMON_ALLOW_DOWNLOAD_BINARIES=on)
    #[arg(long = "allow-download-binaries")]
    pub allow_download_binaries: bool,

    /// Restart the daemon after a completed upgrade
    /// (falls back to $DAEMON_RESTART_AFTER_UPGRADE=on)
    #[arg(long = "restart-after-upgrade")]
    pub restart_after_upgrade: bool,

    /// Arguments passed through to the daemon
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub daemon_args: Vec<String>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Builds and validates the supervisor config from flags and environment.
    pub fn config(&self) -> Result<Config, ConfigError> {
        let cfg = Config {
            home: self
                .home
                .clone()
                .or_else(|| env::var_os("DAEMON_HOME").map(PathBuf::from))
                .unwrap_or_default(),
            name: self
                .name
                .clone()
                .or_else(|| env::var("DAEMON_NAME").ok())
                .unwrap_or_default(),
            allow_download_binaries: self.allow_download_binaries
                || env_flag("DAEMON_ALLOW_DOWNLOAD_BINARIES"),
            restart_after_upgrade: self.restart_after_upgrade
                || env_flag("DAEMON_RESTART_AFTER_UPGRADE"),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|value| value == "on").unwrap_or(false)
}
