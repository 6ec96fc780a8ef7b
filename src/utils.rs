//! Small helpers for logging, file naming, and user-facing messages.

use chrono::{Local, NaiveDateTime};
use std::error::Error;
use std::fs as stdfs;
use std::time::Duration;
use tokio::fs;
use tracing::{info, instrument};

/// The current wall-clock time in the local zone, without offset.
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Truncate a string for logging purposes.
///
/// Cuts on a character boundary, so Cyrillic titles are safe.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}…(+{} bytes)", &s[..cut], s.len() - cut),
    }
}

/// Turn an arbitrary identifier into something safe for a file name.
///
/// Lowercases, drops anything that is not alphanumeric, `-` or `_`, and
/// turns spaces into hyphens.
///
/// ```ignore
/// assert_eq!(slugify("Alice Smith"), "alice-smith");
/// assert_eq!(slugify("../etc/passwd"), "etcpasswd");
/// ```
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ' && c != '-' && c != '_', "")
        .replace(' ', "-")
}

/// Human-readable "try again in" text for throttled callers.
///
/// Sub-second remainders round up so we never tell someone to wait 0 seconds.
pub fn format_wait(wait: Duration) -> String {
    let mut secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs += 1;
    }
    let (minutes, seconds) = (secs / 60, secs % 60);
    if minutes > 0 {
        format!("Too many requests. Wait {minutes} min {seconds} sec before the next one.")
    } else {
        format!("Too many requests. Wait {seconds} sec before the next one.")
    }
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a scratch file.
#[instrument(level = "info", skip_all, fields(path = %path))]
pub async fn ensure_writable_dir(path: &str) -> Result<(), Box<dyn Error>> {
    if let Err(e) = fs::create_dir_all(path).await {
        return Err(Box::new(e));
    }
    let scratch_path = format!("{}/..__write_check__", path.trim_end_matches('/'));
    match stdfs::File::create(&scratch_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&scratch_path);
            info!("Output directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}
