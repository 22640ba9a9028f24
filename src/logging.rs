// Timestamped stderr logging with an optional file mirror
//
// Every line goes through `tlog!`, tagged with the module it came from
// (`[session]`, `[btle]`, ...). Once `init_file_logging` has run, lines are
// also appended to a per-run file so a failed flash can be inspected later.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{OtaError, OtaResult};

/// Log file mirror; `None` until file logging is started.
pub static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

/// Stable symlink to the newest log in the log directory.
const LATEST_LOG_NAME: &str = "ble-ota.log";

/// `HH:MM:SS.mmm` in local time.
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Write one already-formatted line to stderr and, when enabled, the log file.
pub fn emit(message: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", timestamp(), message);
    eprintln!("{line}");
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Start mirroring log lines to `<log_dir>/<YYYYmmdd-HHMMSS>-ble-ota.log`.
/// On Unix, `ble-ota.log` in the same directory is pointed at the new file.
pub fn init_file_logging(log_dir: &Path) -> OtaResult<PathBuf> {
    std::fs::create_dir_all(log_dir).map_err(|e| {
        OtaError::Config(format!("Failed to create log dir {}: {e}", log_dir.display()))
    })?;

    let file_name = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-ble-ota.log")
        .to_string();
    let log_path = log_dir.join(&file_name);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| {
            OtaError::Config(format!("Failed to open log file {}: {e}", log_path.display()))
        })?;

    #[cfg(unix)]
    {
        let latest = log_dir.join(LATEST_LOG_NAME);
        let _ = std::fs::remove_file(&latest);
        if let Err(e) = std::os::unix::fs::symlink(&file_name, &latest) {
            emit(format_args!(
                "[logging] Could not link {}: {e}",
                latest.display()
            ));
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    emit(format_args!("[logging] Writing log to {}", log_path.display()));
    Ok(log_path)
}

/// Close the log file; stderr output continues.
pub fn stop_file_logging() {
    let closed = LOG_FILE
        .lock()
        .map(|mut guard| guard.take().is_some())
        .unwrap_or(false);
    if closed {
        emit(format_args!("[logging] Log file closed"));
    }
}

/// `tlog!("[module] format", args...)`: timestamped line to stderr and the
/// log file, if one is open.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}
