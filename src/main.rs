//! ptyrelay - run your shell through a pseudo-terminal and record everything it prints
//!
//! ptyrelay starts the shell on a pty, puts your terminal into raw mode and
//! relays bytes in both directions. Every byte the shell writes is also
//! appended to a raw capture log, one segment per session, so other tools
//! can replay or render the session later.
//!
//! # Features
//!
//! - **Transparent relay**: keystrokes and output pass through untouched
//! - **Raw capture**: `output.bin` gets every output byte, flushed as it arrives
//! - **Window size sync**: resizes reach the shell and `term_size.json`
//! - **Bootstrap**: exports, `pty_*` helper functions and a custom prompt
//!
//! # Quick Start
//!
//! ```text
//! ptyrelay                 # Start $SHELL
//! ptyrelay -s /bin/zsh     # Start zsh
//! ptyrelay cmd info        # Helper command (normally run as pty_info)
//! ```

mod config;
mod core;
mod helper;

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, SessionPaths};
use crate::core::bootstrap::{Bootstrap, SessionEnv};
use crate::core::pty::resolve_shell;
use crate::core::session::{self, SessionOptions, Terminal};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line options
#[derive(Debug, Default)]
struct CliArgs {
    shell: Option<String>,
    log_dir: Option<PathBuf>,
    no_bootstrap: bool,
    /// `cmd <name>`; `Some("")` when no name was given
    helper: Option<String>,
}

fn print_version() {
    eprintln!("ptyrelay {}", VERSION);
}

fn print_help() {
    eprintln!("ptyrelay {} - pseudo-terminal session relay with raw capture", VERSION);
    eprintln!();
    eprintln!("Usage: ptyrelay [OPTIONS]");
    eprintln!("       ptyrelay cmd <COMMAND>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Shell to run (default: $SHELL, then /bin/sh)");
    eprintln!("  -l, --log-dir <DIR>   Directory for log, capture and size record");
    eprintln!("  --no-bootstrap        Do not type exports, helpers and prompt into the shell");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Helper commands (available in the shell as pty_<COMMAND>):");
    eprintln!("  info                  Session information");
    eprintln!("  help                  List helper commands");
    eprintln!("  log                   Last lines of the session log");
    eprintln!("  rawlog                Hexdump of the end of the raw capture");
    eprintln!("  clear                 Clear the screen and show the banner");
    eprintln!("  colors                Terminal colour test");
    eprintln!();
    eprintln!("Files (in the log directory, default ~/.ptyrelay/log):");
    eprintln!("  pty_terminal.log      Diagnostic log");
    eprintln!("  output.bin            Raw shell output, one segment per session");
    eprintln!("  term_size.json        Latest window size");
    eprintln!();
    eprintln!("Configuration: ~/.ptyrelay/config.toml");
    eprintln!();
    eprintln!("Exit: Type 'exit' in the shell");
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                cli.shell = Some(args[i].clone());
            }
            "-l" | "--log-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing log directory argument".to_string());
                }
                cli.log_dir = Some(PathBuf::from(&args[i]));
            }
            "--no-bootstrap" => {
                cli.no_bootstrap = true;
            }
            "cmd" => {
                cli.helper = Some(args.get(i + 1).cloned().unwrap_or_default());
                break;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(cli)
}

/// Send tracing output to the session log file; stdout belongs to the shell.
fn init_logging(paths: &SessionPaths, level: &str) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

fn print_banner(shell: &str, paths: &SessionPaths) {
    eprintln!("ptyrelay {}: starting {}", VERSION, shell);
    eprintln!("  log:     {}", paths.log_file.display());
    eprintln!("  capture: {}", paths.raw_output.display());
    eprintln!("Type 'exit' to end the session.");
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let cli = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    if let Some(name) = cli.helper {
        let name = if name.is_empty() { "help" } else { name.as_str() };
        let known = helper::run(name, &mut io::stdout().lock())?;
        std::process::exit(if known { 0 } else { 1 });
    }

    let mut config = Config::load();
    if cli.shell.is_some() {
        config.shell = cli.shell;
    }
    if cli.log_dir.is_some() {
        config.log_dir = cli.log_dir;
    }
    if cli.no_bootstrap {
        config.bootstrap = false;
    }

    let paths = SessionPaths::new(config.resolve_log_dir());
    paths
        .prepare()
        .with_context(|| format!("Failed to create log directory {}", paths.log_dir.display()))?;
    if let Err(e) = init_logging(&paths, &config.log_level) {
        eprintln!("Warning: cannot open log file {}: {}", paths.log_file.display(), e);
    }

    let shell = resolve_shell(config.shell.as_deref());
    info!("ptyrelay {} starting, log dir {}", VERSION, paths.log_dir.display());

    let env = SessionEnv {
        log_file: paths.log_file.clone(),
        raw_output_file: paths.raw_output.clone(),
        size_file: paths.term_size.clone(),
        helper: env::current_exe().context("Failed to locate the ptyrelay binary")?,
    };

    let mut options = SessionOptions::new(shell.clone(), paths.clone(), env.clone());
    options.chunk_size = config.chunk_size();
    options.log_data = config.log_data;
    if config.bootstrap {
        options.bootstrap = Some(Bootstrap {
            env,
            shell: shell.clone(),
            prompt_bash: config.prompt.bash.clone(),
            prompt_zsh: config.prompt.zsh.clone(),
            delay: config.bootstrap_delay(),
        });
    }

    print_banner(&shell, &paths);

    let terminal = Terminal::stdio().context("Failed to open the terminal")?;
    let summary = match session::run(terminal, &options) {
        Ok(summary) => summary,
        Err(e) => {
            error!("Session failed to start: {:#}", e);
            return Err(e);
        }
    };

    eprintln!("\nptyrelay: session ended (exit code {})", summary.exit_code);
    std::process::exit(summary.exit_code);
}
