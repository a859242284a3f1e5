//! Process logging for the engine binary: a compact console stream for
//! operators plus a rotated file stream for log shipping, with startup-time
//! retention of old rotated files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Rotated files are named `orra-engine.log.<date>` by the daily appender.
const FILE_STEM: &str = "orra-engine.log";

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub dir: PathBuf,
    /// Rotated files older than this are deleted when logging starts.
    pub retention: Duration,
    /// Emit the file stream as JSON lines; the console stream stays compact
    /// either way.
    pub json_file: bool,
}

impl LoggingOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention: Duration::from_secs(14 * 24 * 60 * 60),
            json_file: true,
        }
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn plain_file(mut self) -> Self {
        self.json_file = false;
        self
    }
}

/// Keeps the non-blocking file writer alive. Dropping the guard flushes any
/// buffered lines and stops file logging.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Install the process-wide subscriber. Safe to call more than once; later
/// calls keep the first subscriber and only return a fresh guard.
pub fn init(options: &LoggingOptions) -> anyhow::Result<LogGuard> {
    fs::create_dir_all(&options.dir)?;
    let removed = sweep_rotated_logs(&options.dir, options.retention)?;

    let appender = tracing_appender::rolling::daily(&options.dir, FILE_STEM);
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let file_layer = if options.json_file {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    };
    let console_layer = tracing_subscriber::fmt::layer().compact().with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if removed > 0 {
        tracing::debug!(target: "orra.obs", removed, "removed rotated log files past retention");
    }
    Ok(LogGuard { _worker: worker })
}

/// Age out rotated log files by filesystem modification time. Judging age by
/// mtime rather than the date stamp in the file name keeps hand-renamed or
/// clock-skewed files from lingering forever.
fn sweep_rotated_logs(dir: &Path, retention: Duration) -> io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(FILE_STEM) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if expired && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn default_logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orra-obs-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn default_logs_dir_joins_logs_folder() {
        assert_eq!(
            default_logs_dir(Path::new("/var/lib/orra")),
            PathBuf::from("/var/lib/orra/logs")
        );
    }

    #[test]
    fn sweep_only_touches_expired_rotated_files() {
        let dir = scratch_dir("sweep");
        fs::write(dir.join("orra-engine.log.2026-01-01"), b"old").unwrap();
        fs::write(dir.join("unrelated.txt"), b"keep").unwrap();

        // Everything just written is younger than a day: nothing expires.
        let removed = sweep_rotated_logs(&dir, Duration::from_secs(24 * 60 * 60)).unwrap();
        assert_eq!(removed, 0);

        // Zero retention expires every rotated file but spares other names.
        // A short pause keeps the mtimes safely in the past.
        std::thread::sleep(Duration::from_millis(20));
        let removed = sweep_rotated_logs(&dir, Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.join("orra-engine.log.2026-01-01").exists());
        assert!(dir.join("unrelated.txt").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn options_builder_adjusts_defaults() {
        let options = LoggingOptions::new("/tmp/x")
            .retention(Duration::from_secs(60))
            .plain_file();
        assert_eq!(options.retention, Duration::from_secs(60));
        assert!(!options.json_file);
    }
}
