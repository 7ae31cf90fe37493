//! Process supervision
//!
//! Launches the monitored daemon with piped stdout/stderr, tees both streams
//! to the operator while scanning them for the upgrade marker, and resolves
//! the race between "process exited", "stdout matched" and "stderr matched"
//! into exactly one outcome:
//!
//! - `Ok(Some(info))` — an upgrade was detected (and the daemon was killed)
//! - `Ok(None)`       — the daemon exited cleanly with nothing detected
//! - `Err(err)`       — the daemon failed, or a stream could not be read
//!
//! Each stream gets its own scanner task; the two tasks and the termination
//! wait all feed a single mutex-guarded result where the first offer of
//! either kind wins and an upgrade detection dominates a failure.

use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::scanner::{scanning_writer, wait_for_upgrade, ScanError, ScanningWriter, UpgradeInfo};

/// Supervision failures.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to start {bin}: {source}")]
    Start {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("process exited with {0}")]
    ProcessExit(ExitStatus),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("process has no {0} handle")]
    MissingPipe(&'static str),
}

/// One of the two things a run can produce besides a clean exit.
#[derive(Debug)]
enum Outcome {
    Upgrade(UpgradeInfo),
    Failure(SupervisorError),
}

/// Merge policy for concurrent offers: the first offer of either kind wins,
/// except that an upgrade detection replaces an earlier failure. Once an
/// upgrade is in, nothing changes it.
fn merge(current: Option<Outcome>, candidate: Outcome) -> Option<Outcome> {
    match (&current, &candidate) {
        (None, _) => Some(candidate),
        (Some(Outcome::Failure(_)), Outcome::Upgrade(_)) => Some(candidate),
        _ => current,
    }
}

/// Result slot shared between the scanner tasks and the termination wait.
/// The mutex is the only synchronization; all reads and writes go through it.
#[derive(Default)]
struct SharedResult {
    slot: Mutex<Option<Outcome>>,
}

impl SharedResult {
    fn offer(&self, candidate: Outcome) {
        let mut slot = self.slot.lock();
        let current = slot.take();
        *slot = merge(current, candidate);
    }

    fn take(&self) -> Option<Outcome> {
        self.slot.lock().take()
    }
}

/// Lifecycle of the supervised process. "Signal sent" is tracked as explicit
/// state rather than inferred from the exit status: the OS may report a
/// clean exit even after a kill, and the shared result decides that race.
/// Exit itself ends the wait loop and carries the status with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    SignalSent,
}

/// Runs `bin` with `args` under supervision until it exits or an upgrade
/// marker is seen on its stdout or stderr.
///
/// Both streams are forwarded verbatim to the given sinks so daemon output
/// stays visible live. On detection the daemon receives a best-effort kill;
/// the kill's own outcome is ignored, correctness is governed solely by the
/// shared result. A clean fast exit with nothing recorded (e.g. a one-shot
/// subcommand) returns `Ok(None)` immediately; every other path drains both
/// scanner tasks to end-of-stream before returning so no readers dangle into
/// the next supervised run.
///
/// Known limitation: a marker emitted at the exact instant of a clean exit
/// can be missed; the clean-exit fast path wins that race by design.
pub async fn launch_and_watch<O, E>(
    bin: &Path,
    args: &[String],
    stdout: O,
    stderr: E,
) -> Result<Option<UpgradeInfo>, SupervisorError>
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let mut child = Command::new(bin)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::Start {
            bin: bin.display().to_string(),
            source,
        })?;

    log::info!("started {} {}", bin.display(), args.join(" "));

    let out_pipe = child
        .stdout
        .take()
        .ok_or(SupervisorError::MissingPipe("stdout"))?;
    let err_pipe = child
        .stderr
        .take()
        .ok_or(SupervisorError::MissingPipe("stderr"))?;

    let result = Arc::new(SharedResult::default());
    // Kept open on our side so recv() below never reports a closed channel
    // just because both scanner tasks finished without a detection.
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(2);

    let out_task = tokio::spawn(watch_stream(
        out_pipe,
        stdout,
        Arc::clone(&result),
        kill_tx.clone(),
    ));
    let err_task = tokio::spawn(watch_stream(
        err_pipe,
        stderr,
        Arc::clone(&result),
        kill_tx.clone(),
    ));

    let mut state = ProcessState::Running;
    let status = loop {
        match state {
            ProcessState::Running => {
                tokio::select! {
                    status = child.wait() => break status.map_err(SupervisorError::Wait)?,
                    _ = kill_rx.recv() => {
                        state = ProcessState::SignalSent;
                        // best effort; failure here only means the process is
                        // already on its way out
                        if let Err(err) = child.start_kill() {
                            log::warn!("failed to signal daemon for shutdown: {err}");
                        }
                    }
                }
            }
            ProcessState::SignalSent => {
                break child.wait().await.map_err(SupervisorError::Wait)?;
            }
        }
    };

    if status.success() {
        return match result.take() {
            // The kill can race a clean exit: the signal was sent but the OS
            // still reported success. The recorded detection wins.
            Some(Outcome::Upgrade(info)) => {
                if state == ProcessState::SignalSent {
                    log::debug!("daemon exited cleanly after shutdown signal");
                }
                let _ = tokio::join!(out_task, err_task);
                Ok(Some(info))
            }
            // A clean, undetected exit is not an upgrade trigger and not an
            // error. The scanner tasks are abandoned here; the dead process's
            // pipes hit end-of-stream on their own. A scan failure recorded
            // against a clean exit is dropped.
            _ => Ok(None),
        };
    }

    // The process failed (possibly because we killed it). Offer the exit
    // failure; a recorded upgrade dominates it.
    result.offer(Outcome::Failure(SupervisorError::ProcessExit(status)));

    // Drain both scanners to end-of-stream before returning.
    let _ = tokio::join!(out_task, err_task);

    match result.take() {
        Some(Outcome::Upgrade(info)) => Ok(Some(info)),
        Some(Outcome::Failure(err)) => Err(err),
        None => Err(SupervisorError::ProcessExit(status)),
    }
}

/// One scanner task: tees the stream into the operator sink, feeds complete
/// lines to the marker scanner, and offers its outcome into the shared
/// result. A detection requests a best-effort kill of the daemon.
async fn watch_stream<R, W>(
    reader: R,
    sink: W,
    result: Arc<SharedResult>,
    kill: mpsc::Sender<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: Write + Send + 'static,
{
    let (writer, mut lines) = scanning_writer(sink);

    let pump = pump_stream(reader, writer);
    let scan = async {
        match wait_for_upgrade(&mut lines).await {
            Ok(Some(info)) => {
                log::info!(
                    "upgrade \"{}\" needed at height {}, stopping daemon",
                    info.name,
                    info.height
                );
                result.offer(Outcome::Upgrade(info));
                let _ = kill.try_send(());
            }
            Ok(None) => {}
            Err(err) => result.offer(Outcome::Failure(err.into())),
        }
    };

    // The pump keeps forwarding output after a match so the stream is always
    // drained to end-of-stream.
    tokio::join!(pump, scan);
}

/// Copies the stream into the scanning writer until end-of-stream. Read and
/// sink failures end the line sequence with the error.
async fn pump_stream<R, W>(mut reader: R, mut writer: ScanningWriter<W>)
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut buf = [0u8; 8192];
    let failure = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(err) = writer.write_all(&buf[..n]) {
                    break Some(err);
                }
            }
            Err(err) => break Some(err),
        }
    };
    if let Some(err) = failure {
        writer.abort(err);
    }
}
