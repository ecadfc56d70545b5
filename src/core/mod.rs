//! Core session components.
//!
//! - **tty**: raw mode for the user's terminal, restored on drop
//! - **pty**: pty allocation and shell spawning
//! - **winsize**: window size queries, propagation and SIGWINCH notification
//! - **capture**: append-only raw output log with session markers
//! - **relay**: the poll loop moving bytes between terminal and pty
//! - **bootstrap**: exports, helper functions and prompt typed into the shell
//! - **session**: ties the pieces together for one shell run
//!
//! # Architecture
//!
//! ```text
//! session::run
//! ├── CaptureLog (output.bin)
//! ├── PtyChild (master fd + shell process)
//! ├── ModeGuard (saved termios)
//! ├── WindowSync + ResizeWatcher (term_size.json)
//! └── Relay (stdin -> pty, pty -> stdout + capture)
//! ```

pub mod bootstrap;
pub mod capture;
pub mod pty;
pub mod relay;
pub mod session;
pub mod tty;
pub mod winsize;
