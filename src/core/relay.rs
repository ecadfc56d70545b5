//! Bidirectional relay between the real terminal and the pty
//!
//! One thread, one `poll` over the real input, the pty master and the
//! resize pipe. Keystrokes go to the pty unchanged; shell output goes to
//! the real output and, byte for byte, to the capture log. The loop runs
//! until one side closes or an I/O error occurs, with no timeout.

use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};
use tracing::{debug, error, info, warn};

use super::capture::CaptureLog;
use super::winsize::{ResizeWatcher, WindowSync};

/// Bytes read per wakeup unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Upper bound for a configured chunk size.
pub const MAX_CHUNK_SIZE: usize = 65536;

/// Why the relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Real input reached end of stream
    InputClosed,
    /// The pty closed, normally because the shell exited
    ShellExited,
    /// Unrecoverable read/write/poll error
    Failed(io::Error),
}

/// Summary returned when the relay stops
#[derive(Debug)]
pub struct RelayReport {
    pub end: RelayEnd,
    /// Bytes forwarded from the real input to the pty
    pub bytes_in: u64,
    /// Bytes forwarded from the pty to the real output
    pub bytes_out: u64,
}

enum Step {
    Continue,
    Stop(RelayEnd),
}

pub struct Relay<'a, W: Write> {
    input: BorrowedFd<'a>,
    pty: BorrowedFd<'a>,
    output: W,
    capture: Option<&'a mut CaptureLog>,
    watcher: Option<&'a ResizeWatcher>,
    sync: Option<&'a mut WindowSync>,
    chunk_size: usize,
    log_data: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl<'a, W: Write> Relay<'a, W> {
    pub fn new(input: BorrowedFd<'a>, pty: BorrowedFd<'a>, output: W) -> Self {
        Self {
            input,
            pty,
            output,
            capture: None,
            watcher: None,
            sync: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_data: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Tee shell output into `log`.
    pub fn capture(mut self, log: &'a mut CaptureLog) -> Self {
        self.capture = Some(log);
        self
    }

    /// Re-sync the pty size whenever `watcher` fires.
    pub fn resize(mut self, watcher: &'a ResizeWatcher, sync: &'a mut WindowSync) -> Self {
        self.watcher = Some(watcher);
        self.sync = Some(sync);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Log every relayed chunk at debug level.
    pub fn log_data(mut self, enabled: bool) -> Self {
        self.log_data = enabled;
        self
    }

    /// Relay until either side closes.
    pub fn run(mut self) -> RelayReport {
        info!("Relay started (chunk size {})", self.chunk_size);
        let mut buf = vec![0u8; self.chunk_size];

        let end = loop {
            let watcher = self.watcher;
            let mut fds = vec![
                PollFd::new(self.pty, PollFlags::POLLIN),
                PollFd::new(self.input, PollFlags::POLLIN),
            ];
            if let Some(watcher) = watcher {
                fds.push(PollFd::new(watcher.as_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("poll failed: {}", e);
                    break RelayEnd::Failed(e.into());
                }
            }

            let pty_ready = is_ready(fds[0].revents());
            let input_ready = is_ready(fds[1].revents());
            let resize_ready = fds.get(2).map_or(false, |fd| is_ready(fd.revents()));
            drop(fds);

            // Size changes land before any further output is handled.
            if resize_ready {
                if let Some(watcher) = watcher {
                    watcher.drain();
                }
                if let Some(sync) = self.sync.as_deref_mut() {
                    sync.sync(self.pty);
                }
            }

            if pty_ready {
                if let Step::Stop(end) = self.pump_output(&mut buf) {
                    break end;
                }
            }

            if input_ready {
                if let Step::Stop(end) = self.pump_input(&mut buf) {
                    break end;
                }
            }
        };

        info!(
            "Relay finished: {:?}, input {} bytes, output {} bytes",
            end, self.bytes_in, self.bytes_out
        );
        RelayReport {
            end,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
        }
    }

    fn pump_output(&mut self, buf: &mut [u8]) -> Step {
        let n = match read(self.pty, buf) {
            Ok(0) => {
                info!("Shell exited");
                return Step::Stop(RelayEnd::ShellExited);
            }
            Ok(n) => n,
            // Linux reports a hung-up pty master as EIO.
            Err(Errno::EIO) => {
                info!("PTY closed");
                return Step::Stop(RelayEnd::ShellExited);
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Step::Continue,
            Err(e) => {
                error!("Read from pty failed: {}", e);
                return Step::Stop(RelayEnd::Failed(e.into()));
            }
        };
        let data = &buf[..n];

        if let Err(e) = self.output.write_all(data).and_then(|_| self.output.flush()) {
            error!("Write to terminal failed: {}", e);
            return Step::Stop(RelayEnd::Failed(e));
        }

        if let Some(log) = self.capture.as_deref_mut() {
            if let Err(e) = log.append(data) {
                warn!("{}, capture disabled for this session", e);
                self.capture = None;
            }
        }

        self.bytes_out += n as u64;
        if self.log_data {
            debug!("OUTPUT ({} bytes): {}", n, data.escape_ascii());
        }
        Step::Continue
    }

    fn pump_input(&mut self, buf: &mut [u8]) -> Step {
        let n = match read(self.input, buf) {
            Ok(0) => {
                info!("Input closed");
                return Step::Stop(RelayEnd::InputClosed);
            }
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Step::Continue,
            Err(e) => {
                error!("Read from terminal failed: {}", e);
                return Step::Stop(RelayEnd::Failed(e.into()));
            }
        };
        let data = &buf[..n];

        if let Err(e) = write_all(self.pty, data) {
            error!("Write to pty failed: {}", e);
            return Step::Stop(RelayEnd::Failed(e));
        }

        self.bytes_in += n as u64;
        if self.log_data {
            debug!("INPUT ({} bytes): {}", n, data.escape_ascii());
        }
        Step::Continue
    }
}

fn is_ready(revents: Option<PollFlags>) -> bool {
    revents.map_or(false, |r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
    })
}

/// Write the whole buffer to a raw descriptor.
pub fn write_all<F: AsFd>(fd: F, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match write(&fd, &data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::parse_segments;
    use crate::core::winsize::{apply, query, WindowSize};
    use nix::pty::openpty;
    use nix::unistd::pipe;
    use std::fs;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_input_round_trip() {
        let data = pattern(100_000);
        let (input_read, input_write) = pipe().unwrap();
        let (relay_side, mut shell_side) = UnixStream::pair().unwrap();

        let shell = thread::spawn(move || {
            let mut received = Vec::new();
            shell_side.read_to_end(&mut received).unwrap();
            received
        });

        let feeder = {
            let data = data.clone();
            thread::spawn(move || {
                write_all(&input_write, &data).unwrap();
            })
        };

        let report = Relay::new(input_read.as_fd(), relay_side.as_fd(), Vec::new()).run();
        feeder.join().unwrap();
        drop(relay_side);

        assert!(matches!(report.end, RelayEnd::InputClosed));
        assert_eq!(report.bytes_in, data.len() as u64);
        assert_eq!(report.bytes_out, 0);
        assert_eq!(shell.join().unwrap(), data);
    }

    #[test]
    fn test_output_capture_fidelity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.bin");
        let data = pattern(50_000);

        let (input_read, _input_write) = pipe().unwrap();
        let (relay_side, mut shell_side) = UnixStream::pair().unwrap();

        let shell = {
            let data = data.clone();
            thread::spawn(move || {
                std::io::Write::write_all(&mut shell_side, &data).unwrap();
            })
        };

        let mut output = Vec::new();
        let mut log = CaptureLog::open(&path).unwrap();
        let report = Relay::new(input_read.as_fd(), relay_side.as_fd(), &mut output)
            .capture(&mut log)
            .chunk_size(4096)
            .run();
        shell.join().unwrap();
        log.close().unwrap();

        assert!(matches!(report.end, RelayEnd::ShellExited));
        assert_eq!(report.bytes_out, data.len() as u64);
        assert_eq!(output, data);

        let raw = fs::read(&path).unwrap();
        let segments = parse_segments(&raw);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].complete);
        assert_eq!(segments[0].body, &data[..]);
    }

    #[test]
    fn test_ls_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.bin");

        let (input_read, input_write) = pipe().unwrap();
        let (relay_side, mut shell_side) = UnixStream::pair().unwrap();

        // Echo what is typed; answer the command once a newline arrives.
        let shell = thread::spawn(move || {
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            while shell_side.read(&mut byte).unwrap() == 1 {
                std::io::Write::write_all(&mut shell_side, &byte).unwrap();
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            std::io::Write::write_all(&mut shell_side, b"a.txt\nb.txt\n").unwrap();
            line
        });

        write_all(&input_write, b"ls\n").unwrap();

        let mut output = Vec::new();
        let mut log = CaptureLog::open(&path).unwrap();
        let report = Relay::new(input_read.as_fd(), relay_side.as_fd(), &mut output)
            .capture(&mut log)
            .log_data(true)
            .run();
        log.close().unwrap();

        assert_eq!(shell.join().unwrap(), b"ls\n");
        assert!(matches!(report.end, RelayEnd::ShellExited));
        assert_eq!(report.bytes_in, 3);
        assert_eq!(output, b"ls\na.txt\nb.txt\n");

        let raw = fs::read(&path).unwrap();
        let segments = parse_segments(&raw);
        assert_eq!(segments[0].body, b"ls\na.txt\nb.txt\n");
        drop(input_write);
    }

    #[test]
    fn test_resize_applied_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let real = openpty(None, None).unwrap();
        apply(&real.master, WindowSize::new(77, 21)).unwrap();
        let inner = openpty(None, None).unwrap();

        let watcher = ResizeWatcher::detached().unwrap();
        let mut sync = WindowSync::new(&real.slave, dir.path().join("term_size.json")).unwrap();
        watcher.notify().unwrap();

        let slave = inner.slave;
        let shell = thread::spawn(move || {
            write_all(&slave, b"x").unwrap();
        });

        let (input_read, _input_write) = pipe().unwrap();
        let mut output = Vec::new();
        let report = Relay::new(input_read.as_fd(), inner.master.as_fd(), &mut output)
            .resize(&watcher, &mut sync)
            .run();
        shell.join().unwrap();

        assert!(matches!(report.end, RelayEnd::ShellExited));
        assert_eq!(query(&inner.master).unwrap(), WindowSize::new(77, 21));
        assert_eq!(sync.last(), Some(WindowSize::new(77, 21)));
        assert!(dir.path().join("term_size.json").exists());
    }

    #[test]
    fn test_pty_error_stops_relay() {
        let (read_end, write_end) = pipe().unwrap();
        drop(read_end);
        let (input_read, _input_write) = pipe().unwrap();

        let report = Relay::new(input_read.as_fd(), write_end.as_fd(), Vec::new()).run();
        assert!(matches!(report.end, RelayEnd::Failed(_)));
    }

    struct BrokenTerminal;

    impl Write for BrokenTerminal {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_output_error_stops_relay() {
        let (input_read, _input_write) = pipe().unwrap();
        let (relay_side, mut shell_side) = UnixStream::pair().unwrap();
        std::io::Write::write_all(&mut shell_side, b"prompt$ ").unwrap();

        let report = Relay::new(input_read.as_fd(), relay_side.as_fd(), BrokenTerminal).run();
        match report.end {
            RelayEnd::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected end: {:?}", other),
        }
        assert_eq!(report.bytes_out, 0);
    }

    #[test]
    fn test_chunk_size_is_bounded() {
        let (input_read, _input_write) = pipe().unwrap();
        let (relay_side, _shell_side) = UnixStream::pair().unwrap();
        let relay = Relay::new(input_read.as_fd(), relay_side.as_fd(), Vec::new())
            .chunk_size(usize::MAX);
        assert_eq!(relay.chunk_size, MAX_CHUNK_SIZE);
        let relay = relay.chunk_size(0);
        assert_eq!(relay.chunk_size, 1);
    }
}
