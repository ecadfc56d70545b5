//! Window size propagation
//!
//! The real terminal's dimensions are copied onto the pty master and
//! written to a small JSON record read by the snapshot renderer. Resize
//! notifications arrive through [`ResizeWatcher`], a self-pipe fed by the
//! SIGWINCH handler so the relay loop can poll it like any other source.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use chrono::Local;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, read};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Query the window size of a terminal descriptor.
pub fn query<F: AsFd>(fd: F) -> io::Result<WindowSize> {
    let mut ws = WindowSize::default().to_winsize();
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    if ws.ws_col == 0 || ws.ws_row == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "terminal reported a zero size",
        ));
    }
    Ok(WindowSize::new(ws.ws_col, ws.ws_row))
}

/// Apply a window size to a terminal descriptor (normally the pty master).
pub fn apply<F: AsFd>(fd: F, size: WindowSize) -> io::Result<()> {
    let ws = size.to_winsize();
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// On-disk window size record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeRecord {
    pub cols: u16,
    pub rows: u16,
    pub updated: String,
}

impl SizeRecord {
    pub fn now(size: WindowSize) -> Self {
        Self {
            cols: size.cols,
            rows: size.rows,
            updated: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }
    }

    /// Replace the record at `path` wholesale.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Copies the real terminal's size onto the pty.
pub struct WindowSync {
    source: OwnedFd,
    record_path: PathBuf,
    last: Option<WindowSize>,
}

impl WindowSync {
    /// `source` is the real terminal whose size is mirrored.
    pub fn new<F: AsFd>(source: F, record_path: PathBuf) -> io::Result<Self> {
        Ok(Self {
            source: source.as_fd().try_clone_to_owned()?,
            record_path,
            last: None,
        })
    }

    /// Last size successfully applied.
    pub fn last(&self) -> Option<WindowSize> {
        self.last
    }

    /// Query, apply and persist. Every failure is logged and swallowed.
    pub fn sync<F: AsFd>(&mut self, pty: F) -> Option<WindowSize> {
        let size = match query(&self.source) {
            Ok(size) => size,
            Err(e) => {
                warn!("Cannot query terminal size: {}", e);
                return None;
            }
        };

        if let Err(e) = apply(&pty, size) {
            warn!("Cannot set pty size: {}", e);
            return None;
        }
        self.last = Some(size);
        info!("Terminal size: {}x{}", size.cols, size.rows);

        match SizeRecord::now(size).save(&self.record_path) {
            Ok(()) => debug!("Saved terminal size to {}", self.record_path.display()),
            Err(e) => warn!("Cannot save terminal size: {}", e),
        }

        Some(size)
    }
}

/// Write end of the installed watcher's pipe, or -1.
static RESIZE_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigwinch(_: libc::c_int) {
    wake(RESIZE_PIPE.load(Ordering::SeqCst));
}

/// Write one byte to `fd`. Async-signal-safe; errno is left as it was.
fn wake(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    let byte = 1u8;
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
    Errno::set_raw(saved);
}

/// Pollable resize notifications.
pub struct ResizeWatcher {
    read_end: OwnedFd,
    write_end: OwnedFd,
    installed: bool,
}

impl ResizeWatcher {
    /// A watcher not connected to SIGWINCH.
    pub fn detached() -> io::Result<Self> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            read_end,
            write_end,
            installed: false,
        })
    }

    /// A watcher fed by SIGWINCH. Only one may be installed at a time.
    pub fn install() -> io::Result<Self> {
        let mut watcher = Self::detached()?;

        let claimed = RESIZE_PIPE.compare_exchange(
            -1,
            watcher.write_end.as_raw_fd(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if claimed.is_err() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a resize watcher is already installed",
            ));
        }

        let action = SigAction::new(
            SigHandler::Handler(handle_sigwinch),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        if let Err(e) = unsafe { sigaction(Signal::SIGWINCH, &action) } {
            RESIZE_PIPE.store(-1, Ordering::SeqCst);
            return Err(e.into());
        }
        watcher.installed = true;
        debug!("SIGWINCH handler installed");

        Ok(watcher)
    }

    /// Consume pending notifications; true if there were any.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut seen = false;
        loop {
            match read(&self.read_end, &mut buf) {
                Ok(0) => return seen,
                Ok(_) => seen = true,
                Err(Errno::EINTR) => continue,
                Err(_) => return seen,
            }
        }
    }
}

#[cfg(test)]
impl ResizeWatcher {
    /// Raise a notification by hand.
    pub fn notify(&self) -> io::Result<()> {
        wake(self.write_end.as_raw_fd());
        Ok(())
    }
}

impl AsFd for ResizeWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }
}

impl Drop for ResizeWatcher {
    fn drop(&mut self) {
        if self.installed {
            let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            let _ = unsafe { sigaction(Signal::SIGWINCH, &action) };
            RESIZE_PIPE.store(-1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    #[test]
    fn test_apply_and_query() {
        let pty = openpty(None, None).unwrap();
        apply(&pty.master, WindowSize::new(132, 43)).unwrap();
        assert_eq!(query(&pty.slave).unwrap(), WindowSize::new(132, 43));
    }

    #[test]
    fn test_query_non_terminal_fails() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        assert!(query(&read_end).is_err());
    }

    #[test]
    fn test_sync_propagates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("term_size.json");

        let real = openpty(None, None).unwrap();
        apply(&real.master, WindowSize::new(100, 30)).unwrap();
        let inner = openpty(None, None).unwrap();

        let mut sync = WindowSync::new(&real.slave, record.clone()).unwrap();
        assert_eq!(sync.sync(&inner.master), Some(WindowSize::new(100, 30)));
        assert_eq!(query(&inner.slave).unwrap(), WindowSize::new(100, 30));

        let saved = SizeRecord::load(&record).unwrap();
        assert_eq!((saved.cols, saved.rows), (100, 30));
        assert!(!saved.updated.is_empty());

        // Last write wins
        apply(&real.master, WindowSize::new(60, 20)).unwrap();
        sync.sync(&inner.master);
        let saved = SizeRecord::load(&record).unwrap();
        assert_eq!((saved.cols, saved.rows), (60, 20));
        assert_eq!(sync.last(), Some(WindowSize::new(60, 20)));
    }

    #[test]
    fn test_sync_survives_unwritable_record() {
        let real = openpty(None, None).unwrap();
        apply(&real.master, WindowSize::new(90, 25)).unwrap();
        let inner = openpty(None, None).unwrap();

        let mut sync =
            WindowSync::new(&real.slave, PathBuf::from("/nonexistent/dir/term_size.json")).unwrap();
        assert_eq!(sync.sync(&inner.master), Some(WindowSize::new(90, 25)));
        assert_eq!(query(&inner.slave).unwrap(), WindowSize::new(90, 25));
    }

    #[test]
    fn test_record_json_fields() {
        let record = SizeRecord::now(WindowSize::new(120, 40));
        let value: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["cols"], 120);
        assert_eq!(value["rows"], 40);
        assert!(value["updated"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_watcher_notify_and_drain() {
        let watcher = ResizeWatcher::detached().unwrap();
        assert!(!watcher.drain());
        watcher.notify().unwrap();
        watcher.notify().unwrap();
        assert!(watcher.drain());
        assert!(!watcher.drain());
    }

    #[test]
    fn test_wake_keeps_errno() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        Errno::set_raw(libc::EINTR);
        // Writing to a read end fails with EBADF
        wake(read_end.as_raw_fd());
        assert_eq!(Errno::last_raw(), libc::EINTR);
    }

    #[test]
    fn test_watcher_receives_sigwinch() {
        let watcher = ResizeWatcher::install().unwrap();
        assert!(ResizeWatcher::install().is_err());
        nix::sys::signal::raise(Signal::SIGWINCH).unwrap();
        assert!(watcher.drain());
        drop(watcher);

        let again = ResizeWatcher::install().unwrap();
        drop(again);
    }
}
