//! upvisor - supervises a daemon binary and upgrades it in place
//!
//! Runs the configured daemon under the process supervisor, watching its
//! output for upgrade markers. When a marker is seen the daemon is stopped,
//! the new binary becomes current, and the daemon is optionally restarted
//! under it.

use upvisor::cli::Cli;
use upvisor::launcher::{launch_process, LaunchOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse_args();
    let args = cli.daemon_args.clone();
    let cfg = cli.config()?;

    loop {
        match launch_process(&cfg, &args, std::io::stdout(), std::io::stderr()).await? {
            LaunchOutcome::Upgraded(info) if cfg.restart_after_upgrade => {
                log::info!("restarting daemon after upgrade to {}", info.name);
            }
            LaunchOutcome::Upgraded(info) => {
                log::info!("upgrade to {} applied, exiting without restart", info.name);
                break;
            }
            LaunchOutcome::Exited => break,
        }
    }

    Ok(())
}
