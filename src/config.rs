//! Supervisor configuration and the on-disk version layout
//!
//! All versions of the supervised daemon live under `<home>/upgrade_manager`:
//!
//! ```text
//! <home>/upgrade_manager/genesis/bin/<name>            initial binary
//! <home>/upgrade_manager/upgrades/<escaped>/bin/<name> candidate binaries
//! <home>/upgrade_manager/current                       symlink to the active
//!                                                      version directory
//! ```
//!
//! The `current` symlink is the single mutable value that selects the active
//! version. Path composition never touches the filesystem and cannot fail.

use std::fs;
use std::io;
use std::path::PathBuf;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

const ROOT_NAME: &str = "upgrade_manager";
const GENESIS_DIR: &str = "genesis";
const UPGRADES_DIR: &str = "upgrades";
const CURRENT_LINK: &str = "current";

/// Characters escaped when an upgrade name becomes a path segment. Upgrade
/// names are operator/governance supplied strings and may contain anything.
const UPGRADE_NAME_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Configuration validation errors, one distinct reason per failure mode.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("daemon name is not set")]
    NameNotSet,

    #[error("daemon home is not set")]
    HomeNotSet,

    #[error("daemon home must be an absolute path, got {}", .0.display())]
    HomeNotAbsolute(PathBuf),

    #[error("cannot stat root directory {}: {source}", .path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a directory", .0.display())]
    RootNotDirectory(PathBuf),
}

/// Control knobs for the supervisor. Validated once at startup and immutable
/// afterwards; passed by reference into everything that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Daemon home directory (absolute).
    pub home: PathBuf,
    /// Name of the daemon binary.
    pub name: String,
    /// Download a missing upgrade binary using the marker's info field.
    pub allow_download_binaries: bool,
    /// Relaunch the daemon after a completed upgrade.
    pub restart_after_upgrade: bool,
}

impl Config {
    /// Root directory where all version state lives.
    pub fn root(&self) -> PathBuf {
        self.home.join(ROOT_NAME)
    }

    /// Path to the genesis binary, the version installed first.
    pub fn genesis_bin(&self) -> PathBuf {
        self.root().join(GENESIS_DIR).join("bin").join(&self.name)
    }

    /// Directory holding the named upgrade. The name is percent-escaped
    /// before use as a path segment.
    pub fn upgrade_dir(&self, upgrade_name: &str) -> PathBuf {
        let safe: String = utf8_percent_encode(upgrade_name, UPGRADE_NAME_ESCAPE).collect();
        self.root().join(UPGRADES_DIR).join(safe)
    }

    /// Path to the binary for the named upgrade.
    pub fn upgrade_bin(&self, upgrade_name: &str) -> PathBuf {
        self.upgrade_dir(upgrade_name).join("bin").join(&self.name)
    }

    /// Location of the `current` symlink.
    pub(crate) fn current_link(&self) -> PathBuf {
        self.root().join(CURRENT_LINK)
    }

    /// Path to the currently selected binary.
    ///
    /// Resolves the `current` symlink to the underlying version directory.
    /// When the link is missing, not a symlink, or unreadable (e.g. on first
    /// run) this falls back to the genesis binary; it never fails.
    pub fn current_bin(&self) -> PathBuf {
        let link = self.current_link();
        let meta = match fs::symlink_metadata(&link) {
            Ok(meta) => meta,
            Err(_) => return self.genesis_bin(),
        };
        if !meta.file_type().is_symlink() {
            return self.genesis_bin();
        }
        match fs::read_link(&link) {
            Ok(dest) => dest.join("bin").join(&self.name),
            Err(_) => self.genesis_bin(),
        }
    }

    /// Checks the configuration once at startup.
    ///
    /// The root directory must already exist; creating it is install
    /// tooling's job, and a missing root usually means a mistyped home.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::NameNotSet);
        }
        if self.home.as_os_str().is_empty() {
            return Err(ConfigError::HomeNotSet);
        }
        if !self.home.is_absolute() {
            return Err(ConfigError::HomeNotAbsolute(self.home.clone()));
        }

        let root = self.root();
        let meta = fs::metadata(&root).map_err(|source| ConfigError::RootUnreadable {
            path: root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ConfigError::RootNotDirectory(root));
        }

        Ok(())
    }
}
