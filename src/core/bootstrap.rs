//! Shell bootstrap payload
//!
//! After the shell starts, a block of shell text is typed into the pty:
//! exports that describe the session, one function per helper command and
//! a custom prompt. The shell cannot tell it apart from keyboard input.

use std::ffi::OsString;
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::info;

use super::relay::write_all;

/// Helper commands bound as `pty_<name>` shell functions.
pub const HELPER_COMMANDS: &[&str] = &["info", "help", "log", "rawlog", "clear", "colors"];

/// Values exported into the shell
#[derive(Debug, Clone)]
pub struct SessionEnv {
    pub log_file: PathBuf,
    pub raw_output_file: PathBuf,
    pub size_file: PathBuf,
    pub helper: PathBuf,
}

impl SessionEnv {
    /// Variables also placed directly in the shell's environment.
    pub fn vars(&self) -> Vec<(String, OsString)> {
        vec![
            ("PTY_TERMINAL".to_string(), OsString::from("1")),
            ("PTY_LOG_FILE".to_string(), self.log_file.clone().into_os_string()),
            (
                "PTY_RAW_OUTPUT_FILE".to_string(),
                self.raw_output_file.clone().into_os_string(),
            ),
            ("PTY_SIZE_FILE".to_string(), self.size_file.clone().into_os_string()),
            ("PTY_HELPER".to_string(), self.helper.clone().into_os_string()),
        ]
    }
}

/// What to type into the shell once it is up.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub env: SessionEnv,
    pub shell: String,
    pub prompt_bash: String,
    pub prompt_zsh: String,
    pub delay: Duration,
}

/// Quote a value for use inside double quotes in POSIX shells.
fn double_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a value for use inside single quotes.
fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_zsh(shell: &str) -> bool {
    shell.rsplit('/').next().map_or(false, |name| name.contains("zsh"))
}

impl Bootstrap {
    /// Exports and helper functions.
    pub fn init_script(&self) -> String {
        let env = &self.env;
        let mut script = String::new();

        script.push_str("\n# ptyrelay session\n");
        script.push_str("export PTY_TERMINAL=1\n");
        for (name, path) in [
            ("PTY_LOG_FILE", &env.log_file),
            ("PTY_RAW_OUTPUT_FILE", &env.raw_output_file),
            ("PTY_SIZE_FILE", &env.size_file),
            ("PTY_HELPER", &env.helper),
        ] {
            script.push_str(&format!(
                "export {}={}\n",
                name,
                double_quote(&path.to_string_lossy())
            ));
        }

        script.push('\n');
        for cmd in HELPER_COMMANDS {
            script.push_str(&format!("pty_{cmd}() {{ \"$PTY_HELPER\" cmd {cmd}; }}\n"));
        }
        script
    }

    /// Prompt assignment for the target shell.
    pub fn prompt_line(&self) -> String {
        if is_zsh(&self.shell) {
            format!("PROMPT={}\n", single_quote(&self.prompt_zsh))
        } else {
            format!("PS1={}\n", single_quote(&self.prompt_bash))
        }
    }

    /// The full text written into the pty.
    pub fn payload(&self) -> String {
        let mut payload = self.init_script();
        payload.push('\n');
        payload.push_str(&self.prompt_line());
        payload.push_str("pty_clear\n");
        payload
    }

    /// Wait for the shell to settle, then type the payload into `pty`.
    pub fn inject<F: AsFd>(&self, pty: F) -> io::Result<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let payload = self.payload();
        write_all(&pty, payload.as_bytes())?;
        info!(
            "Injected bootstrap ({} bytes, helper {})",
            payload.len(),
            self.env.helper.display()
        );
        Ok(())
    }
}
