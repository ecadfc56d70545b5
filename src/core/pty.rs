//! Pseudo-terminal allocation and shell spawning
//!
//! This module opens a pty pair and starts the user's shell on the slave
//! side. The child is started through `std::process::Command` with a
//! pre-exec hook that makes it a session leader, adopts the slave as its
//! controlling terminal and duplicates the slave onto stdin, stdout and
//! stderr. The parent keeps the master and the child handle.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::winsize::WindowSize;

/// Used when neither the configuration nor `$SHELL` names a shell.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Exit status reported when the shell could not be executed.
pub const EXEC_FAILED_STATUS: i32 = 127;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(#[source] nix::Error),

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to execute {shell}: {source}")]
    Exec {
        shell: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Pick the shell to run: explicit choice, then `$SHELL`, then `/bin/sh`.
pub fn resolve_shell(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| DEFAULT_SHELL.to_string())
}

/// A shell running on the slave side of a pty
pub struct PtyChild {
    master: OwnedFd,
    child: Child,
    shell: String,
}

impl PtyChild {
    /// Open a pty of the given size and start `shell` on it.
    pub fn spawn(shell: &str, size: Option<WindowSize>, env: &[(String, OsString)]) -> Result<Self> {
        let ws = size.map(|s| libc::winsize {
            ws_row: s.rows,
            ws_col: s.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });
        let pty = openpty(ws.as_ref(), None).map_err(PtyError::Open)?;
        for fd in [&pty.master, &pty.slave] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Open)?;
        }
        debug!("PTY opened: master={}", pty.master.as_raw_fd());

        let slave_fd = pty.slave.as_raw_fd();
        let mut command = Command::new(shell);
        command.envs(env.iter().map(|(k, v)| (k, v)));

        // Runs in the forked child only; no allocation, no locks.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                for target in 0..=2 {
                    if libc::dup2(slave_fd, target) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| classify_spawn_error(shell, e))?;
        drop(pty.slave);

        info!("PTY created: pid={}, shell={}", child.id(), shell);

        Ok(Self {
            master: pty.master,
            child,
            shell: shell.to_string(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Controller side of the pty.
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Whether the shell is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close the master, hang up a shell that is still running, and reap it.
    pub fn shutdown(self) -> Result<i32> {
        let PtyChild {
            master, mut child, ..
        } = self;
        drop(master);
        debug!("PTY master closed");

        if matches!(child.try_wait(), Ok(None)) {
            let pid = Pid::from_raw(child.id() as i32);
            info!("Shell {} still running, sending SIGHUP", pid);
            if let Err(e) = kill(pid, Signal::SIGHUP) {
                warn!("Failed to signal shell {}: {}", pid, e);
            }
        }

        let status = child.wait().map_err(PtyError::Wait)?;
        let code = exit_code(status);
        info!("Child exited: exit_code={}", code);
        Ok(code)
    }
}

/// Errors from `Command::spawn` mix fork failures with exec failures
/// reported back by the child; split them apart.
fn classify_spawn_error(shell: &str, e: io::Error) -> PtyError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => PtyError::Exec {
            shell: shell.to_string(),
            source: e,
        },
        _ if e.raw_os_error() == Some(libc::ENOEXEC) => PtyError::Exec {
            shell: shell.to_string(),
            source: e,
        },
        _ => PtyError::Spawn(e),
    }
}

/// Shell-style exit code: the status, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}
