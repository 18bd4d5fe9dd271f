use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Global log file path protected by Mutex
///
/// When None, logs go to stdout.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Logs a message with timestamp to configured output
///
/// # Arguments
/// * `message` - The message to log
///
/// # Returns
/// * `io::Result<()>` - Ok on success, Err if writing fails
pub fn log(message: &str) -> io::Result<()> {
    log_with_cycle(message, None)
}

/// Logs a message with timestamp and optional poll cycle number
///
/// Every line written while a poll cycle is running carries the cycle
/// number, so one cycle can be followed through listing, delivery and save.
///
/// # Arguments
/// * `message` - The message to log
/// * `cycle` - Optional poll cycle number
///
/// # Example
/// ```text
/// // log_with_cycle("Found new file a.csv", Some(12)).unwrap();
/// // 2024-05-01 10:00:00 [C12] Found new file a.csv
/// ```
pub fn log_with_cycle(message: &str, cycle: Option<u64>) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let log_message = match cycle {
        Some(n) => format!("{} [C{}] {}\n", timestamp, n, message),
        None => format!("{} {}\n", timestamp, message),
    };

    // A poisoned lock only means another thread panicked mid-log; the path is still valid
    let guard = LOG_FILE.lock().unwrap_or_else(|e| e.into_inner());
    match &*guard {
        Some(log_file) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            file.write_all(log_message.as_bytes())?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(log_message.as_bytes())?;
        }
    }

    Ok(())
}

/// Sets the path for the log file
///
/// Subsequent calls to the log functions append to this file.
///
/// # Errors
/// Returns `InvalidInput` if the path is not valid UTF-8.
pub fn set_log_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path_str = path.as_ref().to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "log file path is not valid UTF-8")
    })?;
    *LOG_FILE.lock().unwrap_or_else(|e| e.into_inner()) = Some(path_str.to_string());
    Ok(())
}
