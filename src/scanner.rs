//! Output-stream marker scanning
//!
//! Wraps a daemon output stream so that every byte is forwarded verbatim to
//! the operator's terminal while complete lines are scanned for the upgrade
//! marker the daemon prints when it wants to be replaced:
//!
//! ```text
//! UPGRADE "<name>" NEEDED at height <height>: <info>
//! ```
//!
//! The match is case-sensitive, line-local and found anywhere within a line;
//! everything after the colon (which may itself contain colons or URLs) is
//! kept verbatim as the info field.

use std::io::{self, Write};

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Marker line grammar, matched as a substring of a single line.
const UPGRADE_PATTERN: &str = r#"UPGRADE "([^"]+)" NEEDED at height (\d+): (.*)"#;

/// Upgrade request parsed from a marker line.
///
/// Produced at most once per supervised run and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeInfo {
    /// Target version identifier.
    pub name: String,
    /// Height in the monitored system at which the upgrade triggers.
    pub height: u64,
    /// Free-form descriptor, typically a download URL.
    pub info: String,
}

/// Failure reading a monitored stream.
#[derive(Error, Debug)]
#[error("failed to read process output: {0}")]
pub struct ScanError(#[from] pub io::Error);

/// Writer half of a scanning tee.
///
/// Every chunk written is passed through to the sink unmodified and in
/// order, and buffered internally until a complete line can be handed to the
/// paired [`LineSource`]. Dropping the writer ends the line sequence once
/// buffered lines are drained; a trailing unterminated line is yielded last.
pub struct ScanningWriter<W: Write> {
    sink: W,
    buf: Vec<u8>,
    lines: mpsc::UnboundedSender<io::Result<String>>,
}

/// Lazy, finite, non-restartable sequence of complete lines.
pub struct LineSource {
    rx: mpsc::UnboundedReceiver<io::Result<String>>,
}

/// Tees writes to `sink` and splits them into lines for marker scanning.
pub fn scanning_writer<W: Write>(sink: W) -> (ScanningWriter<W>, LineSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScanningWriter {
            sink,
            buf: Vec::new(),
            lines: tx,
        },
        LineSource { rx },
    )
}

impl<W: Write> ScanningWriter<W> {
    /// Ends the line sequence with a read failure from the underlying
    /// stream. Any buffered partial line is discarded.
    pub fn abort(mut self, err: io::Error) {
        self.buf.clear();
        let _ = self.lines.send(Err(err));
    }

    fn push_line(&mut self, mut line: Vec<u8>) {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        // The paired LineSource may already be gone (a marker was found and
        // the scan stopped); passthrough still continues, so just drop the
        // line.
        let _ = self
            .lines
            .send(Ok(String::from_utf8_lossy(&line).into_owned()));
    }
}

impl<W: Write> Write for ScanningWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.sink.write_all(data)?;
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            self.push_line(line);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W: Write> Drop for ScanningWriter<W> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.push_line(line);
        }
    }
}

impl LineSource {
    /// Next complete line, or `None` once the writer is closed and all
    /// buffered lines have been drained.
    pub async fn next_line(&mut self) -> Option<io::Result<String>> {
        self.rx.recv().await
    }
}

/// Consumes lines until the first upgrade marker.
///
/// Returns `Ok(Some(info))` on the first matching line, leaving any further
/// lines unconsumed. Returns `Ok(None)` when the source ends without a
/// match; that is a normal outcome, not an error. Returns `Err` only if
/// reading the underlying stream failed.
pub async fn wait_for_upgrade(lines: &mut LineSource) -> Result<Option<UpgradeInfo>, ScanError> {
    let marker = Regex::new(UPGRADE_PATTERN).expect("marker pattern is valid");
    while let Some(line) = lines.next_line().await {
        let line = line.map_err(ScanError)?;
        if let Some(info) = parse_upgrade_line(&marker, &line) {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

fn parse_upgrade_line(marker: &Regex, line: &str) -> Option<UpgradeInfo> {
    let caps = marker.captures(line)?;
    let height = caps[2].parse().ok()?;
    Some(UpgradeInfo {
        name: caps[1].to_string(),
        height,
        info: caps[3].to_string(),
    })
}
