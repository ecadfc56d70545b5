//! Raw capture log
//!
//! Every byte the shell prints is appended to `output.bin`, wrapped in a
//! textual header when a session opens and an end marker when it closes.
//! The file is only ever appended to, so it holds one segment per session.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{info, warn};

/// Width of the `=` rule around the session header.
const RULE_WIDTH: usize = 50;

const SESSION_LABEL: &[u8] = b"Session: ";

/// Written when a session segment is closed.
pub const END_MARKER: &[u8] = b"\n--- Session End ---\n";

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open capture log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write capture log: {0}")]
    Write(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// Header that opens a segment.
pub fn session_header(timestamp: &str) -> String {
    format!("\n{rule}\nSession: {timestamp}\n{rule}\n", rule = rule())
}

/// An open segment of the capture log.
pub struct CaptureLog {
    file: File,
    path: PathBuf,
    bytes: u64,
    closed: bool,
}

impl CaptureLog {
    /// Open `path` for appending and write the session header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| CaptureError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut log = Self {
            file,
            path: path.to_path_buf(),
            bytes: 0,
            closed: false,
        };
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        log.write_flushed(session_header(&timestamp).as_bytes())?;
        info!("Opened capture log {}", path.display());

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shell bytes captured in this segment.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Append shell output and flush it straight away.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.write_flushed(data)?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Write the end marker. Dropping an open log does the same.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.write_flushed(END_MARKER)?;
        info!(
            "Closed capture log {} ({} bytes)",
            self.path.display(),
            self.bytes
        );
        Ok(())
    }

    fn write_flushed(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).map_err(CaptureError::Write)?;
        self.file.flush().map_err(CaptureError::Write)
    }
}

impl Drop for CaptureLog {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("{}", e);
        }
    }
}

/// One session's worth of capture log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    /// Timestamp from the header line
    pub started: String,
    /// Raw shell output
    pub body: &'a [u8],
    /// Whether the end marker was written
    pub complete: bool,
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Locate the next header at or after `from`: (start, body start, timestamp).
fn next_header(data: &[u8], from: usize) -> Option<(usize, usize, String)> {
    let rule = rule();
    let opener = format!("\n{}\n", rule);
    let mut at = from;

    while let Some(start) = find(data, opener.as_bytes(), at) {
        let label = start + opener.len();
        if data[label..].starts_with(SESSION_LABEL) {
            let stamp_start = label + SESSION_LABEL.len();
            if let Some(eol) = find(data, b"\n", stamp_start) {
                let closer = format!("{}\n", rule);
                if data[eol + 1..].starts_with(closer.as_bytes()) {
                    let stamp = String::from_utf8_lossy(&data[stamp_start..eol]).into_owned();
                    return Some((start, eol + 1 + closer.len(), stamp));
                }
            }
        }
        at = start + 1;
    }
    None
}

/// Split a capture log into its session segments.
///
/// Bytes before the first header are ignored. A segment without an end
/// marker (a session still running, or one that died without cleanup) is
/// returned with `complete == false`.
pub fn parse_segments(data: &[u8]) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut cursor = next_header(data, 0);

    while let Some((_, body_start, started)) = cursor {
        let following = next_header(data, body_start);
        let end = following.as_ref().map_or(data.len(), |(start, _, _)| *start);
        let region = &data[body_start..end];

        let (body, complete) = match region.strip_suffix(END_MARKER) {
            Some(body) => (body, true),
            None => (region, false),
        };
        segments.push(Segment {
            started,
            body,
            complete,
        });
        cursor = following;
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_header_format() {
        let header = session_header("2024-01-01T00:00:00");
        let rule = "=".repeat(50);
        assert_eq!(
            header,
            format!("\n{}\nSession: 2024-01-01T00:00:00\n{}\n", rule, rule)
        );
    }

    #[test]
    fn test_segment_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.bin");

        let mut log = CaptureLog::open(&path).unwrap();
        log.append(b"\x1b[1mhello\x1b[0m\r\n").unwrap();
        assert_eq!(log.bytes(), 15);
        log.close().unwrap();

        let data = fs::read(&path).unwrap();
        assert!(data.starts_with(format!("\n{}\nSession: ", "=".repeat(50)).as_bytes()));
        assert!(data.ends_with(END_MARKER));

        let segments = parse_segments(&data);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].body, b"\x1b[1mhello\x1b[0m\r\n");
        assert!(segments[0].complete);
    }

    #[test]
    fn test_sequential_sessions_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.bin");

        let mut first = CaptureLog::open(&path).unwrap();
        first.append(b"first session").unwrap();
        first.close().unwrap();

        let mut second = CaptureLog::open(&path).unwrap();
        second.append(b"second session").unwrap();
        second.close().unwrap();

        let data = fs::read(&path).unwrap();
        let segments = parse_segments(&data);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].body, b"first session");
        assert_eq!(segments[1].body, b"second session");
        assert!(segments.iter().all(|s| s.complete));
        assert!(segments.iter().all(|s| !s.started.is_empty()));
    }

    #[test]
    fn test_drop_writes_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.bin");

        {
            let mut log = CaptureLog::open(&path).unwrap();
            log.append(b"abc").unwrap();
        }

        let data = fs::read(&path).unwrap();
        assert!(data.ends_with(END_MARKER));
        assert_eq!(data.windows(END_MARKER.len()).filter(|w| *w == END_MARKER).count(), 1);
    }

    #[test]
    fn test_incomplete_segment() {
        let mut data = session_header("t0").into_bytes();
        data.extend_from_slice(b"partial output");
        let segments = parse_segments(&data);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].started, "t0");
        assert_eq!(segments[0].body, b"partial output");
        assert!(!segments[0].complete);
    }

    #[test]
    fn test_body_with_rule_is_not_a_header() {
        let rule = "=".repeat(50);
        let mut data = session_header("t0").into_bytes();
        data.extend_from_slice(format!("\n{}\nnot a header\n", rule).as_bytes());
        data.extend_from_slice(END_MARKER);

        let segments = parse_segments(&data);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].complete);
        assert!(segments[0].body.ends_with(b"not a header\n"));
    }

    #[test]
    fn test_open_missing_directory() {
        let err = CaptureLog::open(Path::new("/nonexistent/dir/output.bin"));
        assert!(matches!(err, Err(CaptureError::Open { .. })));
    }
}
