//! Session management
//!
//! A session runs one shell through a pty from start to finish: capture
//! log opened, shell spawned, terminal put into raw mode, size synced,
//! bootstrap typed, relay run, terminal restored, shell reaped and capture
//! closed. Cleanup runs on every path out of [`run`].

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, OwnedFd};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::bootstrap::{Bootstrap, SessionEnv};
use super::capture::CaptureLog;
use super::pty::{PtyChild, PtyError, EXEC_FAILED_STATUS};
use super::relay::{Relay, RelayEnd, DEFAULT_CHUNK_SIZE};
use super::tty::ModeGuard;
use super::winsize::{self, ResizeWatcher, WindowSync};
use crate::config::SessionPaths;

/// The user's side of the relay
pub struct Terminal {
    input: OwnedFd,
    output: OwnedFd,
}

impl Terminal {
    pub fn new(input: OwnedFd, output: OwnedFd) -> Self {
        Self { input, output }
    }

    /// The process's own stdin and stdout.
    pub fn stdio() -> io::Result<Self> {
        Ok(Self {
            input: io::stdin().as_fd().try_clone_to_owned()?,
            output: io::stdout().as_fd().try_clone_to_owned()?,
        })
    }
}

/// Everything needed to run a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: String,
    pub paths: SessionPaths,
    pub env: SessionEnv,
    pub bootstrap: Option<Bootstrap>,
    pub chunk_size: usize,
    pub log_data: bool,
    /// Install the SIGWINCH listener
    pub watch_resize: bool,
}

impl SessionOptions {
    pub fn new(shell: String, paths: SessionPaths, env: SessionEnv) -> Self {
        Self {
            shell,
            paths,
            env,
            bootstrap: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_data: false,
            watch_resize: true,
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub struct SessionSummary {
    /// Exit status to report for the whole process
    pub exit_code: i32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// `None` when the shell never started
    pub end: Option<RelayEnd>,
}

/// A running session; dropping it releases everything it holds.
struct Session {
    child: PtyChild,
    capture: CaptureLog,
    guard: ModeGuard,
    sync: WindowSync,
    watcher: Option<ResizeWatcher>,
    bytes_in: u64,
    bytes_out: u64,
}

/// Run a shell session on `terminal` until it ends.
///
/// Setup failures before raw mode is entered are returned as errors. A
/// shell that cannot be executed yields exit code 127.
pub fn run(terminal: Terminal, options: &SessionOptions) -> Result<SessionSummary> {
    info!("{}", "=".repeat(50));
    info!("Session starting: shell={}", options.shell);

    let capture = CaptureLog::open(&options.paths.raw_output)
        .context("Failed to open raw capture log")?;

    let size = match winsize::query(&terminal.output) {
        Ok(size) => Some(size),
        Err(e) => {
            warn!("Cannot query terminal size: {}", e);
            None
        }
    };

    let child = match PtyChild::spawn(&options.shell, size, &options.env.vars()) {
        Ok(child) => child,
        Err(e @ PtyError::Exec { .. }) => {
            error!("{}", e);
            return Ok(SessionSummary {
                exit_code: EXEC_FAILED_STATUS,
                bytes_in: 0,
                bytes_out: 0,
                end: None,
            });
        }
        Err(e) => return Err(e).context("Failed to start shell"),
    };

    let guard = match ModeGuard::enter(&terminal.input) {
        Ok(guard) => guard,
        Err(e) => {
            let _ = child.shutdown();
            return Err(e).context("Failed to enter raw mode");
        }
    };

    let sync = match WindowSync::new(&terminal.output, options.paths.term_size.clone()) {
        Ok(sync) => sync,
        Err(e) => {
            let _ = child.shutdown();
            return Err(e).context("Failed to prepare window size sync");
        }
    };

    info!(
        "Relaying shell {} (pid {}), raw mode {}, capture {}",
        child.shell(),
        child.pid(),
        guard.is_raw(),
        capture.path().display()
    );

    let mut session = Session {
        child,
        capture,
        guard,
        sync,
        watcher: None,
        bytes_in: 0,
        bytes_out: 0,
    };
    let end = session.relay(terminal, options);
    Ok(session.finish(end))
}

impl Session {
    fn relay(&mut self, terminal: Terminal, options: &SessionOptions) -> RelayEnd {
        self.sync.sync(self.child.master());

        if options.watch_resize {
            match ResizeWatcher::install() {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => warn!("Resize notifications unavailable: {}", e),
            }
        }

        if let Some(bootstrap) = &options.bootstrap {
            if let Err(e) = bootstrap.inject(self.child.master()) {
                error!("Failed to inject bootstrap: {}", e);
                return RelayEnd::Failed(e);
            }
        }

        let output = File::from(terminal.output);
        let mut relay = Relay::new(terminal.input.as_fd(), self.child.master(), output)
            .capture(&mut self.capture)
            .chunk_size(options.chunk_size)
            .log_data(options.log_data);
        if let Some(watcher) = &self.watcher {
            relay = relay.resize(watcher, &mut self.sync);
        }

        let report = relay.run();
        if let Some(size) = self.sync.last() {
            info!("Last window size {}x{}", size.cols, size.rows);
        }
        self.bytes_in = report.bytes_in;
        self.bytes_out = report.bytes_out;
        report.end
    }

    /// Restore the terminal, reap the shell, close the capture segment.
    fn finish(self, end: RelayEnd) -> SessionSummary {
        let Session {
            mut child,
            capture,
            guard,
            watcher,
            bytes_in,
            bytes_out,
            ..
        } = self;
        drop(watcher);

        // Reaping can block on a shell that ignores SIGHUP.
        if let Err(e) = guard.restore() {
            error!("{}", e);
        }

        if child.is_running() {
            info!("Shell {} outlived the relay", child.pid());
        }
        let exit_code = match child.shutdown() {
            Ok(code) => code,
            Err(e) => {
                error!("{}", e);
                1
            }
        };

        let captured = capture.bytes();
        if let Err(e) = capture.close() {
            warn!("{}", e);
        }

        info!(
            "Session ended: {:?}, exit_code={}, input {} bytes, output {} bytes ({} captured)",
            end, exit_code, bytes_in, bytes_out, captured
        );
        SessionSummary {
            exit_code,
            bytes_in,
            bytes_out,
            end: Some(end),
        }
    }
}
