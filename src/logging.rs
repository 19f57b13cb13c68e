use std::fs;
use std::path::PathBuf;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();
const MAX_LOG_FILES: usize = 7; // Keep 7 days of logs

/// Initialize tracing with a console layer and a daily-rotated JSON file
/// layer. Safe to call more than once; only the first call wins.
pub fn init(log_dir: PathBuf, level: &str, console: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = level.to_string();
    INIT.call_once(|| {
        fs::create_dir_all(&log_dir).expect("Failed to create log directory");

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("hearth")
            .filename_suffix("log")
            .build(&log_dir)
            .expect("Failed to create file appender");

        let console_layer = console.then(|| {
            fmt::Layer::new()
                .with_target(true)
                .with_ansi(true)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(level.clone())),
                )
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(
                fmt::Layer::new()
                    .json()
                    .with_writer(file_appender)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(
                        EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| EnvFilter::new(level.clone())),
                    ),
            );

        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");

        cleanup_old_logs(&log_dir);
    });
    Ok(())
}

fn cleanup_old_logs(log_dir: &PathBuf) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "log")
                    .unwrap_or(false)
            })
            .collect();

        // Sort by modification time (newest first)
        log_files.sort_by_key(|entry| {
            std::cmp::Reverse(
                entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )
        });

        for old_file in log_files.iter().skip(MAX_LOG_FILES) {
            let _ = fs::remove_file(old_file.path());
        }
    }
}
