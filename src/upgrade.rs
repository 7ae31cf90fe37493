//! Applying a detected upgrade
//!
//! Makes sure the named upgrade's binary is installed — downloading it from
//! the marker's info URL when allowed — then atomically repoints the
//! `current` symlink at the upgrade directory. The repoint happens only
//! after the binary verifies, so a failed download can never activate a
//! broken version.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Config;
use crate::scanner::UpgradeInfo;

/// Binary verification failures.
#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("binary not found at {}", .0.display())]
    Missing(PathBuf),

    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),

    #[error("{} is not executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("cannot stat {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Upgrade application failures.
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error(transparent)]
    Binary(#[from] BinaryError),

    #[error(
        "binary for upgrade {name} is missing at {} and downloads are disabled",
        .path.display()
    )]
    DownloadDisabled { name: String, path: PathBuf },

    #[error("upgrade info carries no download url: {0:?}")]
    NoUrl(String),

    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Verifies that `path` exists, is a regular file and carries an execute
/// permission bit.
pub fn ensure_binary(path: &Path) -> Result<(), BinaryError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(BinaryError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(BinaryError::Stat {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !meta.is_file() {
        return Err(BinaryError::NotAFile(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(BinaryError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}

/// Makes the named upgrade the active version.
///
/// The upgrade binary must already be installed, or downloadable via the
/// marker's info field when `allow_download_binaries` is set. `current` is
/// repointed only once the binary verifies.
pub async fn do_upgrade(cfg: &Config, info: &UpgradeInfo) -> Result<(), UpgradeError> {
    let bin = cfg.upgrade_bin(&info.name);
    if let Err(err) = ensure_binary(&bin) {
        if !cfg.allow_download_binaries {
            log::error!("upgrade binary invalid and downloads are disabled: {err}");
            return Err(UpgradeError::DownloadDisabled {
                name: info.name.clone(),
                path: bin,
            });
        }
        log::info!(
            "downloading binary for upgrade {} from {}",
            info.name,
            info.info
        );
        download_binary(cfg, info).await?;
        ensure_binary(&bin)?;
    }

    set_current_upgrade(cfg, &info.name)?;
    log::info!("upgrade {} is now the current version", info.name);
    Ok(())
}

/// Atomically repoints `current` at the named upgrade's directory.
///
/// The new link is written as `current.tmp` and renamed over `current`, so a
/// crash can never leave a half-written pointer and at most one version is
/// active at any time.
pub fn set_current_upgrade(cfg: &Config, upgrade_name: &str) -> io::Result<()> {
    let target = cfg.upgrade_dir(upgrade_name);
    let link = cfg.current_link();
    let tmp = link.with_extension("tmp");

    if fs::symlink_metadata(&tmp).is_ok() {
        fs::remove_file(&tmp)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, &tmp)?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(&target, &tmp)?;
    fs::rename(&tmp, &link)
}

/// Downloads the upgrade payload named by `info.info` into the upgrade
/// directory.
///
/// The URL may carry a go-getter style `checksum=sha256:<hex>` query
/// parameter, verified against the raw payload before it is installed.
/// `.tar.gz`/`.tgz` payloads are unpacked into the upgrade directory (they
/// are expected to contain `bin/<name>`); anything else is installed
/// directly as the upgrade binary with mode 0755.
pub async fn download_binary(cfg: &Config, info: &UpgradeInfo) -> Result<(), UpgradeError> {
    let (url, checksum) = split_checksum(info.info.trim());
    if url.is_empty() {
        return Err(UpgradeError::NoUrl(info.info.clone()));
    }

    let dir = cfg.upgrade_dir(&info.name);
    fs::create_dir_all(dir.join("bin"))?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("upvisor/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let response = client.get(&url).send().await?.error_for_status()?;

    // Stream into a staging file; nothing lands at the binary path until the
    // payload has been verified.
    let staging = dir.join(".download.tmp");
    let mut file = fs::File::create(&staging)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?)?;
    }
    file.flush()?;
    drop(file);

    if let Some(expected) = checksum {
        verify_checksum(&staging, &expected, &url)?;
    }

    if is_archive(&url) {
        unpack_archive(&staging, &dir)?;
        fs::remove_file(&staging)?;
    } else {
        let bin = cfg.upgrade_bin(&info.name);
        fs::rename(&staging, &bin)?;
        make_executable(&bin)?;
    }

    Ok(())
}

/// Splits a go-getter style `checksum=sha256:<hex>` query parameter off the
/// URL, keeping any other query parameters intact.
fn split_checksum(raw: &str) -> (String, Option<String>) {
    let Some((base, query)) = raw.split_once('?') else {
        return (raw.to_string(), None);
    };

    let mut kept = Vec::new();
    let mut checksum = None;
    for pair in query.split('&') {
        match pair.strip_prefix("checksum=") {
            Some(value) => {
                let value = value.strip_prefix("sha256:").unwrap_or(value);
                checksum = Some(value.to_string());
            }
            None => kept.push(pair),
        }
    }

    let url = if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    };
    (url, checksum)
}

fn verify_checksum(path: &Path, expected: &str, url: &str) -> Result<(), UpgradeError> {
    let data = fs::read(path)?;
    let actual = format!("{:x}", Sha256::digest(&data));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(UpgradeError::ChecksumMismatch {
            url: url.to_string(),
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

fn is_archive(url: &str) -> bool {
    let path = url.split('?').next().unwrap_or(url);
    path.ends_with(".tar.gz") || path.ends_with(".tgz")
}

fn unpack_archive(archive: &Path, dir: &Path) -> io::Result<()> {
    let file = fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dir)
}

fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(home: &Path) -> Config {
        let cfg = Config {
            home: home.to_path_buf(),
            name: "mockd".to_string(),
            allow_download_binaries: false,
            restart_after_upgrade: false,
        };
        fs::create_dir_all(cfg.root()).unwrap();
        cfg
    }

    fn install_executable(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\nexit 0\n").unwrap();
        make_executable(path).unwrap();
    }

    #[test]
    fn ensure_binary_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(matches!(
            ensure_binary(&path),
            Err(BinaryError::Missing(_))
        ));
    }

    #[test]
    fn ensure_binary_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ensure_binary(dir.path()),
            Err(BinaryError::NotAFile(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_binary_rejects_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"data").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).unwrap();
        assert!(matches!(
            ensure_binary(&path),
            Err(BinaryError::NotExecutable(_))
        ));
    }

    #[test]
    fn ensure_binary_accepts_an_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        install_executable(&path);
        ensure_binary(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn set_current_upgrade_points_at_the_upgrade_dir() {
        let home = tempfile::tempdir().unwrap();
        let cfg = config(home.path());
        fs::create_dir_all(cfg.upgrade_dir("v2")).unwrap();

        set_current_upgrade(&cfg, "v2").unwrap();
        assert_eq!(
            fs::read_link(cfg.root().join("current")).unwrap(),
            cfg.upgrade_dir("v2")
        );
        assert_eq!(cfg.current_bin(), cfg.upgrade_bin("v2"));
    }

    #[cfg(unix)]
    #[test]
    fn set_current_upgrade_replaces_an_existing_pointer() {
        let home = tempfile::tempdir().unwrap();
        let cfg = config(home.path());
        fs::create_dir_all(cfg.upgrade_dir("v2")).unwrap();
        fs::create_dir_all(cfg.upgrade_dir("v3")).unwrap();

        set_current_upgrade(&cfg, "v2").unwrap();
        set_current_upgrade(&cfg, "v3").unwrap();
        assert_eq!(cfg.current_bin(), cfg.upgrade_bin("v3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn do_upgrade_uses_a_preinstalled_binary() {
        let home = tempfile::tempdir().unwrap();
        let cfg = config(home.path());
        install_executable(&cfg.upgrade_bin("v2"));

        let info = UpgradeInfo {
            name: "v2".to_string(),
            height: 10,
            info: String::new(),
        };
        do_upgrade(&cfg, &info).await.unwrap();
        assert_eq!(cfg.current_bin(), cfg.upgrade_bin("v2"));
    }

    #[tokio::test]
    async fn do_upgrade_fails_when_binary_missing_and_downloads_disabled() {
        let home = tempfile::tempdir().unwrap();
        let cfg = config(home.path());

        let info = UpgradeInfo {
            name: "v9".to_string(),
            height: 10,
            info: "https://example.com/v9".to_string(),
        };
        let err = do_upgrade(&cfg, &info).await.unwrap_err();
        assert!(matches!(err, UpgradeError::DownloadDisabled { .. }));
        // the pointer was not touched
        assert_eq!(cfg.current_bin(), cfg.genesis_bin());
    }

    #[test]
    fn split_checksum_extracts_the_parameter() {
        let (url, checksum) =
            split_checksum("https://host/bin?checksum=sha256:abCD12");
        assert_eq!(url, "https://host/bin");
        assert_eq!(checksum.as_deref(), Some("abCD12"));
    }

    #[test]
    fn split_checksum_keeps_other_parameters() {
        let (url, checksum) =
            split_checksum("https://host/bin?ref=v2&checksum=sha256:ff&arch=amd64");
        assert_eq!(url, "https://host/bin?ref=v2&arch=amd64");
        assert_eq!(checksum.as_deref(), Some("ff"));
    }

    #[test]
    fn split_checksum_passes_plain_urls_through() {
        let (url, checksum) = split_checksum("https://host/bin");
        assert_eq!(url, "https://host/bin");
        assert_eq!(checksum, None);
    }

    #[test]
    fn archive_urls_are_recognized() {
        assert!(is_archive("https://host/mockd.tar.gz"));
        assert!(is_archive("https://host/mockd.tgz?ref=v2"));
        assert!(!is_archive("https://host/mockd"));
        assert!(!is_archive("https://host/mockd?name=x.tar.gz"));
    }

    #[test]
    fn checksum_verification_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"test content").unwrap();

        // sha256 of "test content"
        let good = "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72";
        verify_checksum(&path, good, "https://host/x").unwrap();
        verify_checksum(&path, &good.to_uppercase(), "https://host/x").unwrap();

        let err = verify_checksum(&path, "deadbeef", "https://host/x").unwrap_err();
        assert!(matches!(err, UpgradeError::ChecksumMismatch { .. }));
    }
}
