// src/logging.rs
//
// Timestamped stderr logging with an optional mirrored log file.
// Every line carries a bracketed component tag; `tlog!` takes it as part of
// the message, `port_log!` builds the `[serial:<path>]` tag for per-port lines.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::SessionError;

/// Mirror target for `tlog!`. When `Some`, lines go to stderr and this file.
static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

const LOG_LINK_NAME: &str = "serialdeck.log";

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Write one already formatted message. Used by the logging macros.
#[doc(hidden)]
pub fn write_line(args: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", stamp(), args);
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Active file logging. Dropping it closes the file.
#[must_use = "file logging stops when the guard is dropped"]
pub struct FileLog {
    path: PathBuf,
}

impl FileLog {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        stop_file_logging();
    }
}

/// Start mirroring log lines into `log_dir`.
///
/// Opens `YYYYmmdd-HHMMSS-serialdeck.log` in append mode and, on Unix, points
/// the `serialdeck.log` symlink at it. A second call switches files.
pub fn init_file_logging(log_dir: &Path) -> Result<FileLog, SessionError> {
    std::fs::create_dir_all(log_dir)?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-serialdeck.log")
        .to_string();
    let path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    // Symlinks on Windows need elevated privileges
    #[cfg(unix)]
    {
        let link = log_dir.join(LOG_LINK_NAME);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            write_line(format_args!("[logging] Failed to link {}: {}", LOG_LINK_NAME, e));
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    write_line(format_args!("[logging] File logging started: {}", path.display()));

    Ok(FileLog { path })
}

/// Close the log file, if one is open. Stderr logging continues.
pub fn stop_file_logging() {
    let Ok(mut guard) = LOG_FILE.lock() else {
        return;
    };
    if let Some(mut file) = guard.take() {
        let line = format!("{} [logging] File logging stopped", stamp());
        eprintln!("{}", line);
        let _ = writeln!(file, "{}", line);
    }
}

/// Timestamped log line: `HH:MM:SS.mmm [component] message`.
/// The component tag is written by the caller as the start of the message.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(format_args!($($arg)*))
    };
}

/// Log line tagged with the serial port it concerns: `[serial:<path>] ...`
#[macro_export]
macro_rules! port_log {
    ($path:expr, $($arg:tt)*) => {
        $crate::logging::write_line(format_args!(
            "[serial:{}] {}",
            $path,
            format_args!($($arg)*)
        ))
    };
}
