//! upvisor: daemon supervision with marker-driven binary upgrades
//!
//! upvisor launches a long-running daemon, tees its stdout/stderr to the
//! operator, and watches both streams for a self-reported upgrade marker.
//! On detection it stops the daemon, verifies (or downloads) the new
//! binary version, atomically repoints the `current` symlink that selects
//! the active version, and optionally restarts under the new binary.

pub mod cli;
pub mod config;
pub mod launcher;
pub mod scanner;
pub mod supervisor;
pub mod upgrade;

pub use config::{Config, ConfigError};
pub use launcher::{launch_process, LaunchError, LaunchOutcome};
pub use scanner::{scanning_writer, wait_for_upgrade, LineSource, ScanError, ScanningWriter, UpgradeInfo};
pub use supervisor::{launch_and_watch, SupervisorError};
pub use upgrade::{do_upgrade, ensure_binary, set_current_upgrade, BinaryError, UpgradeError};
