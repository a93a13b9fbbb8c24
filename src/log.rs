//! File logging for the monitoring core.
//!
//! Lines go to `~/.overseer/overseer.log` as `[HH:MM:SS.mmm] [LEVEL] message`.
//! The threshold is INFO, DEBUG with `--debug` or `OVERSEER_DEBUG=1`, and
//! `OVERSEER_LOG=<level>` overrides both. Escalations are written at ERROR
//! with a `CRITICAL` tag so they stand out.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Local};

static SINK: OnceLock<Sink> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    const ALL: [Level; 5] = [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace];

    pub fn label(&self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Level::ALL
            .into_iter()
            .find(|l| l.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}

/// The open log file. Writes from concurrent Guardians are serialized here.
struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

/// Set the threshold from flags and environment and open the default log file.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("OVERSEER_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let mut level = if debug || env_debug { Level::Debug } else { Level::Info };
    if let Some(explicit) = std::env::var("OVERSEER_LOG").ok().and_then(|v| v.parse().ok()) {
        level = explicit;
    }
    set_level(level);

    if let Some(home) = dirs::home_dir() {
        init_at(home.join(".overseer").join("overseer.log"));
    }
}

/// Open (and truncate) `path` as the log file. Only the first call takes effect.
pub fn init_at(path: PathBuf) {
    if SINK.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let opened = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path);
    if let Ok(file) = opened {
        let _ = SINK.set(Sink {
            path,
            file: Mutex::new(file),
        });
    }
}

pub fn log_path() -> Option<&'static Path> {
    SINK.get().map(|s| s.path.as_path())
}

pub fn set_level(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

fn render(at: DateTime<Local>, level: Level, args: fmt::Arguments<'_>) -> String {
    format!("[{}] [{}] {}", at.format("%H:%M:%S%.3f"), level.label(), args)
}

/// Write one line if `level` passes the threshold. Called by the `olog*` macros.
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let line = render(Local::now(), level, args);
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(file, "{}", line);
    }
}

#[macro_export]
macro_rules! olog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! olog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Error, format_args!($($arg)*))
    };
}

/// ERROR line tagged `CRITICAL`, for conditions a human has to act on.
#[macro_export]
macro_rules! olog_critical {
    ($($arg:tt)*) => {
        $crate::log::write(
            $crate::log::Level::Error,
            format_args!("CRITICAL {}", format_args!($($arg)*)),
        )
    };
}

#[macro_export]
macro_rules! olog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! olog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! olog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Trace, format_args!($($arg)*))
    };
}
