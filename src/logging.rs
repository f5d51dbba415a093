//! Structured logging for proctype.
//!
//! - `RUST_LOG` environment filter, default `proctype=info`
//! - JSON output when `PROCTYPE_LOG_FORMAT=json`
//! - Daily rolling files for the terminal client so logs never draw over the TUI

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "proctype";
const KEPT_LOG_FILES: usize = 7;

/// Held for the life of the process so buffered lines are flushed on exit.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proctype=info"))
}

fn wants_json() -> bool {
    std::env::var("PROCTYPE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn file_writer(log_dir: &Path) -> Option<NonBlocking> {
    std::fs::create_dir_all(log_dir).ok()?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(KEPT_LOG_FILES)
        .build(log_dir)
        .ok()?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    Some(writer)
}

/// Install the global subscriber, writing rolling files under `log_dir` when
/// it is usable and to stderr otherwise. Repeated calls are no-ops.
pub fn init(log_dir: Option<&Path>) {
    let is_json = wants_json();

    match log_dir.and_then(file_writer) {
        Some(writer) => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            if is_json {
                let _ = subscriber.json().try_init();
            } else {
                let _ = subscriber.try_init();
            }
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .with_target(true);
            if is_json {
                let _ = subscriber.json().try_init();
            } else {
                let _ = subscriber.try_init();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        init(Some(&log_dir));
        init(None);
        assert!(log_dir.is_dir());
    }

    #[test]
    fn test_log_files_roll_under_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_writer(dir.path()).is_some());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("proctype."));
        assert!(names[0].ends_with(".log"));
    }

    #[test]
    fn test_unusable_directory_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        assert!(file_writer(&blocker).is_none());
    }

    #[test]
    fn test_default_filter_names_the_crate() {
        assert!(format!("{:?}", EnvFilter::new("proctype=info")).contains("proctype"));
    }
}
