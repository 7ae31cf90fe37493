//! Launch orchestration
//!
//! Resolves the currently active binary, verifies it, runs it under the
//! process supervisor, and applies a detected upgrade. One call is one
//! supervised run; the binary's outer loop decides whether to go again.

use std::io::Write;

use thiserror::Error;

use crate::config::Config;
use crate::scanner::UpgradeInfo;
use crate::supervisor::{launch_and_watch, SupervisorError};
use crate::upgrade::{do_upgrade, ensure_binary, BinaryError, UpgradeError};

/// How a supervised run ended.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// The daemon exited cleanly with no upgrade detected.
    Exited,
    /// An upgrade was detected and applied; `current` now points at it.
    Upgraded(UpgradeInfo),
}

/// Failures from a supervised run, propagated unchanged to the caller.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("current binary invalid: {0}")]
    Binary(#[from] BinaryError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("failed to apply upgrade: {0}")]
    Upgrade(#[from] UpgradeError),
}

/// Runs the daemon once, forwarding its output to the given sinks, and
/// returns when it exits or after a detected upgrade has been applied.
///
/// Success means either a clean exit with nothing detected or a completed
/// upgrade; the caller never retries on its behalf.
pub async fn launch_process<O, E>(
    cfg: &Config,
    args: &[String],
    stdout: O,
    stderr: E,
) -> Result<LaunchOutcome, LaunchError>
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let bin = cfg.current_bin();
    ensure_binary(&bin)?;

    match launch_and_watch(&bin, args, stdout, stderr).await? {
        Some(info) => {
            log::info!(
                "daemon requested upgrade to {} at height {}",
                info.name,
                info.height
            );
            do_upgrade(cfg, &info).await?;
            Ok(LaunchOutcome::Upgraded(info))
        }
        None => Ok(LaunchOutcome::Exited),
    }
}
