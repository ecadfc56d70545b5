//! Controlling terminal mode handling
//!
//! Raw mode is entered through [`ModeGuard`], which keeps the attribute
//! snapshot taken on entry and puts it back exactly once, either through
//! [`ModeGuard::restore`] or when the guard is dropped (including during a
//! panic unwind).

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::isatty;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TermError {
    #[error("Failed to duplicate terminal descriptor: {0}")]
    Dup(#[source] std::io::Error),

    #[error("Failed to read terminal attributes: {0}")]
    GetAttr(#[source] nix::Error),

    #[error("Failed to set terminal attributes: {0}")]
    SetAttr(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, TermError>;

/// Scoped raw mode on a terminal descriptor.
pub struct ModeGuard {
    fd: OwnedFd,
    saved: Option<Termios>,
}

impl ModeGuard {
    /// Snapshot the terminal attributes of `fd` and switch it to raw mode.
    ///
    /// A descriptor that is not a terminal yields a pass-through guard that
    /// neither changes nor restores anything.
    pub fn enter<F: AsFd>(fd: F) -> Result<Self> {
        let fd = fd.as_fd().try_clone_to_owned().map_err(TermError::Dup)?;

        if !isatty(&fd).unwrap_or(false) {
            warn!("Input is not a terminal, raw mode skipped");
            return Ok(Self { fd, saved: None });
        }

        let saved = tcgetattr(&fd).map_err(TermError::GetAttr)?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&fd, SetArg::TCSANOW, &raw).map_err(TermError::SetAttr)?;
        debug!("Terminal switched to raw mode");

        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }

    /// Whether raw mode is currently applied by this guard.
    pub fn is_raw(&self) -> bool {
        self.saved.is_some()
    }

    /// Put the saved attributes back.
    pub fn restore(mut self) -> Result<()> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            tcsetattr(&self.fd, SetArg::TCSADRAIN, &saved).map_err(TermError::SetAttr)?;
            debug!("Terminal attributes restored");
        }
        Ok(())
    }
}

impl AsFd for ModeGuard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore_inner() {
            warn!("Failed to restore terminal attributes: {}", e);
        }
    }
}
