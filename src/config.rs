//! Configuration for ptyrelay.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.ptyrelay/config.toml`
//! - Resolution of the session's artifact paths (log, raw capture, size record)
//!
//! # Configuration File
//!
//! ```toml
//! # Shell to run (default: $SHELL, then /bin/sh)
//! shell = "/bin/zsh"
//!
//! # Where the log, raw capture and size record are kept
//! log_dir = "/home/me/.ptyrelay/log"
//!
//! # Type exports, helper functions and the prompt into the shell
//! bootstrap = true
//! bootstrap_delay_ms = 100
//!
//! # Bytes read per wakeup in each direction
//! chunk_size = 1024
//!
//! # Log level and whether to log every relayed chunk
//! log_level = "debug"
//! log_data = true
//!
//! [prompt]
//! bash = '\[\033[1;36m\][PTY]\[\033[0m\] \w $ '
//! zsh = '%F{cyan}%B[PTY]%b%f %~ $ '
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::relay::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Name of the per-user configuration directory under `$HOME`.
const APP_DIR: &str = ".ptyrelay";

pub const LOG_FILE_NAME: &str = "pty_terminal.log";
pub const RAW_OUTPUT_FILE_NAME: &str = "output.bin";
pub const TERM_SIZE_FILE_NAME: &str = "term_size.json";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell command
    pub shell: Option<String>,
    /// Directory holding the session artifacts
    pub log_dir: Option<PathBuf>,
    /// Inject exports, helpers and prompt after startup
    pub bootstrap: bool,
    /// Grace period before the bootstrap text is typed
    pub bootstrap_delay_ms: u64,
    /// Bytes read per wakeup
    pub chunk_size: usize,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log every relayed chunk at debug level
    pub log_data: bool,
    /// Prompt settings
    pub prompt: PromptConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            log_dir: None,
            bootstrap: true,
            bootstrap_delay_ms: 100,
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_level: "debug".to_string(),
            log_data: true,
            prompt: PromptConfig::default(),
        }
    }
}

/// Prompt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub bash: String,
    pub zsh: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            bash: r"\[\033[1;36m\][PTY]\[\033[0m\] \[\033[33m\]\w\[\033[0m\] $ ".to_string(),
            zsh: "%F{cyan}%B[PTY]%b%f %F{yellow}%~%f $ ".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from a specific file; a missing or unreadable file gives defaults.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                if let Ok(config) = toml::from_str(&content) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(APP_DIR).join("config.toml"))
    }

    /// Relay chunk size, kept within bounds.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    pub fn bootstrap_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_delay_ms)
    }

    /// Directory for session artifacts, made absolute.
    pub fn resolve_log_dir(&self) -> PathBuf {
        let dir = self.log_dir.clone().unwrap_or_else(|| {
            home_dir()
                .map(|home| home.join(APP_DIR).join("log"))
                .unwrap_or_else(|| PathBuf::from("log"))
        });
        absolute(dir)
    }
}

/// Absolute locations of everything a session writes.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub log_dir: PathBuf,
    pub log_file: PathBuf,
    pub raw_output: PathBuf,
    pub term_size: PathBuf,
}

impl SessionPaths {
    pub fn new(log_dir: PathBuf) -> Self {
        let log_dir = absolute(log_dir);
        Self {
            log_file: log_dir.join(LOG_FILE_NAME),
            raw_output: log_dir.join(RAW_OUTPUT_FILE_NAME),
            term_size: log_dir.join(TERM_SIZE_FILE_NAME),
            log_dir,
        }
    }

    /// Create the log directory.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.log_dir)
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
