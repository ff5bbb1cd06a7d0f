//! Logging initialisation.
//!
//! Console output goes to stderr; the optional log file rotates by
//! size, keeping a bounded number of numbered backups. Syslog output
//! belongs to the external logging collaborator and is reported as
//! unavailable rather than silently swallowed.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogLevel, LogSettings};

/// Keeps the subscriber installed for the process lifetime.
pub struct TelemetryGuard {}

pub fn init(settings: &LogSettings) -> io::Result<TelemetryGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(settings.filter).into())
        .with_env_var("PATHFINDERD_LOG")
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if settings.console {
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_target(false),
        ));
    }

    if let Some(path) = &settings.log_file {
        let writer = RotatingFileWriter::open(
            path.clone(),
            settings.log_file_max_size,
            settings.log_file_backup,
        )?;
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(writer)),
        ));
    }

    layers.push(Box::new(filter));

    Registry::default().with(layers).init();

    if settings.syslog {
        tracing::warn!(
            "syslog output is delegated to the external logging collaborator \
             and is not available in this build; use -s or a log file"
        );
    }

    Ok(TelemetryGuard {})
}

fn level_filter(level: LogLevel) -> tracing::metadata::LevelFilter {
    match level {
        LogLevel::Debug => tracing::metadata::LevelFilter::DEBUG,
        LogLevel::Info => tracing::metadata::LevelFilter::INFO,
        LogLevel::Warning => tracing::metadata::LevelFilter::WARN,
        LogLevel::Error | LogLevel::Critical => tracing::metadata::LevelFilter::ERROR,
    }
}

/// Size-rotating log file: when a write would push the file past
/// `max_size`, `file` becomes `file.1`, `file.1` becomes `file.2` and
/// so on, dropping anything past `backups`. With no backups configured
/// the file just grows.
struct RotatingFileWriter {
    path: PathBuf,
    max_size: u64,
    backups: u64,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    fn open(path: PathBuf, max_size: u64, backups: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            backups,
            file,
            written,
        })
    }

    fn backup_path(&self, index: u64) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let _ = std::fs::rename(&from, self.backup_path(index + 1));
            }
        }
        let _ = std::fs::rename(&self.path, self.backup_path(1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.backups > 0
            && self.written > 0
            && self.written.saturating_add(buf.len() as u64) > self.max_size
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
