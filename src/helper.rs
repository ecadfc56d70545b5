//! In-shell helper commands
//!
//! The bootstrap binds `pty_info`, `pty_log` and friends to
//! `ptyrelay cmd <name>`. They read the session's artifacts through the
//! `PTY_*` variables exported into the shell.

use std::env;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor, Stylize};
use crossterm::terminal::{self, Clear, ClearType};

use crate::core::winsize::SizeRecord;

/// Lines shown by `log`
const LOG_TAIL_LINES: usize = 20;
/// Bytes shown by `rawlog`
const RAWLOG_TAIL_BYTES: u64 = 200;

const BOX_WIDTH: usize = 38;

/// Run helper command `name`. Returns `Ok(false)` for an unknown name.
pub fn run<W: Write>(name: &str, out: &mut W) -> io::Result<bool> {
    match name {
        "info" => info(out)?,
        "help" => help(out)?,
        "log" => log(out)?,
        "rawlog" => rawlog(out)?,
        "clear" => clear(out)?,
        "colors" => colors(out)?,
        _ => {
            writeln!(out, "{}", format!("Unknown command: {}", name).red().bold())?;
            writeln!(out, "Run 'pty_help' to list the available commands")?;
            return Ok(false);
        }
    }
    out.flush()?;
    Ok(true)
}

fn env_or_na(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| "N/A".to_string())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .map(PathBuf::from)
        .filter(|path| path.exists())
}

fn box_top<W: Write>(out: &mut W, title: &str) -> io::Result<()> {
    let rule = "═".repeat(BOX_WIDTH);
    writeln!(out, "{}", format!("╔{}╗", rule).cyan().bold())?;
    writeln!(out, "{}", format!("║ {:<width$} ║", title, width = BOX_WIDTH - 2).cyan().bold())?;
    writeln!(out, "{}", format!("╠{}╣", rule).cyan().bold())
}

fn box_bottom<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "{}", format!("╚{}╝", "═".repeat(BOX_WIDTH)).cyan().bold())
}

fn info<W: Write>(out: &mut W) -> io::Result<()> {
    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    let rows_shown = [
        ("PTY_TERMINAL", env_or_na("PTY_TERMINAL")),
        ("SHELL", env_or_na("SHELL")),
        ("TERM", env_or_na("TERM")),
        ("Size", format!("{}x{}", cols, rows)),
        ("Recorded size", recorded_size(env_path("PTY_SIZE_FILE"))),
        ("PID", std::process::id().to_string()),
        ("Version", env!("CARGO_PKG_VERSION").to_string()),
    ];

    box_top(out, "PTY session")?;
    for (label, value) in rows_shown {
        writeln!(out, "{}  {}: {}", "║".cyan().bold(), label, value)?;
    }
    box_bottom(out)
}

/// Size from the session's `term_size.json`, as `COLSxROWS (updated)`.
fn recorded_size(path: Option<PathBuf>) -> String {
    match path.map(|path| SizeRecord::load(&path)) {
        Some(Ok(record)) => format!("{}x{} ({})", record.cols, record.rows, record.updated),
        _ => "N/A".to_string(),
    }
}

fn help<W: Write>(out: &mut W) -> io::Result<()> {
    let commands = [
        ("pty_info", "show session information"),
        ("pty_help", "show this help"),
        ("pty_log", "show the latest log lines"),
        ("pty_rawlog", "hexdump the end of the raw capture"),
        ("pty_clear", "clear the screen and show the banner"),
        ("pty_colors", "test terminal colour support"),
    ];

    writeln!(out, "{}", "PTY session commands:".yellow().bold())?;
    writeln!(out)?;
    for (name, text) in commands {
        writeln!(out, "  {}  - {}", format!("{:<11}", name).green().bold(), text)?;
    }
    writeln!(out)?;
    writeln!(out, "{}", "These commands only exist inside a ptyrelay session".dark_grey())
}

fn log<W: Write>(out: &mut W) -> io::Result<()> {
    let Some(path) = env_path("PTY_LOG_FILE") else {
        writeln!(out, "{}", "Error: log file not found".red().bold())?;
        return Ok(());
    };

    let content = String::from_utf8_lossy(&std::fs::read(path)?).into_owned();
    writeln!(
        out,
        "{}",
        format!("Recent log (last {} lines):", LOG_TAIL_LINES).yellow().bold()
    )?;
    writeln!(out)?;
    for line in tail_lines(&content, LOG_TAIL_LINES) {
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

fn rawlog<W: Write>(out: &mut W) -> io::Result<()> {
    let Some(path) = env_path("PTY_RAW_OUTPUT_FILE") else {
        writeln!(out, "{}", "Error: raw output file not found".red().bold())?;
        return Ok(());
    };

    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(len.saturating_sub(RAWLOG_TAIL_BYTES)))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    writeln!(
        out,
        "{}",
        format!("Raw output (last {} bytes):", RAWLOG_TAIL_BYTES).yellow().bold()
    )?;
    writeln!(out)?;
    for line in hexdump(&data) {
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

fn clear<W: Write>(out: &mut W) -> io::Result<()> {
    queue!(out, Clear(ClearType::All), Clear(ClearType::Purge), MoveTo(0, 0))?;
    box_top(out, "ptyrelay")?;
    writeln!(
        out,
        "{}",
        format!("║ {:<width$} ║", "Type pty_help for session commands", width = BOX_WIDTH - 2)
            .cyan()
            .bold()
    )?;
    box_bottom(out)?;
    writeln!(out)
}

fn colors<W: Write>(out: &mut W) -> io::Result<()> {
    let palette = [
        (Color::Black, Color::DarkGrey),
        (Color::DarkRed, Color::Red),
        (Color::DarkGreen, Color::Green),
        (Color::DarkYellow, Color::Yellow),
        (Color::DarkBlue, Color::Blue),
        (Color::DarkMagenta, Color::Magenta),
        (Color::DarkCyan, Color::Cyan),
        (Color::Grey, Color::White),
    ];

    writeln!(out, "{}", "Terminal colour test:".yellow().bold())?;
    writeln!(out)?;

    for (bright, label) in [(true, "bright"), (false, "normal")] {
        for (normal, light) in palette {
            let color = if bright { light } else { normal };
            write!(out, "{} ", "██".with(color))?;
        }
        writeln!(out, " {}", label)?;
    }
    writeln!(out)?;

    writeln!(
        out,
        "{}  {}  {}  {}",
        "bold".bold(),
        "underline".underlined(),
        "reverse".reverse(),
        "blink".slow_blink()
    )?;
    writeln!(out)?;

    writeln!(out, "256 colours:")?;
    for row in 0..16u16 {
        for col in 0..16u16 {
            let index = (row * 16 + col) as u8;
            queue!(out, SetBackgroundColor(Color::AnsiValue(index)), Print("  "))?;
        }
        queue!(out, ResetColor, SetAttribute(Attribute::Reset), Print("\n"))?;
    }
    Ok(())
}

/// The last `count` lines of `text`.
pub fn tail_lines(text: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].to_vec()
}

/// Format `data` as `offset  hex bytes  |ascii|` lines of 16 bytes.
pub fn hexdump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex = chunk
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            let ascii: String = chunk
                .iter()
                .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
                .collect();
            format!("{:08x}  {:<48}  |{}|", i * 16, hex, ascii)
        })
        .collect()
}
