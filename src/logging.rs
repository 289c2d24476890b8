/*!
 * Logging and tracing initialization
 *
 * The error log must survive rotation: REOPEN swaps the file handle under
 * the subscriber without re-initializing it, so a `mv` + REOPEN cycle works
 * the way operators expect.
 */

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

enum Sink {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Shared, reopenable log destination
///
/// Clones write to the same sink; `reopen` re-opens the file at the same
/// path and swaps it in place.
#[derive(Clone)]
pub struct LogOutput {
    inner: Arc<Mutex<Sink>>,
}

impl LogOutput {
    pub fn stderr() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Sink::Stderr)),
        }
    }

    pub fn file(path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Sink::File {
                path: path.to_path_buf(),
                file,
            })),
        })
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.inner.lock().unwrap_or_else(|e| e.into_inner()) {
            Sink::Stderr => None,
            Sink::File { path, .. } => Some(path.clone()),
        }
    }

    /// Re-open the backing file at its recorded path. A no-op for stderr and
    /// when nothing was rotated away.
    pub fn reopen(&self) -> io::Result<()> {
        let mut sink = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Sink::File { path, file } = &mut *sink {
            *file = open_log_file(path)?;
        }
        Ok(())
    }

    /// Point the sink at a new destination (used when a reconfigure changes
    /// the error_log path)
    pub fn retarget(&self, new_path: Option<&Path>) -> io::Result<()> {
        let mut sink = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *sink = match new_path {
            None => Sink::Stderr,
            Some(p) => Sink::File {
                path: p.to_path_buf(),
                file: open_log_file(p)?,
            },
        };
        Ok(())
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writer handed to the subscriber per event
pub struct LogWriter {
    inner: Arc<Mutex<Sink>>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sink = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *sink {
            Sink::Stderr => io::stderr().write(buf),
            Sink::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sink = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *sink {
            Sink::Stderr => io::stderr().flush(),
            Sink::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogOutput {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Initialize structured logging based on configuration and return the
/// reopenable output so the cycle can register it for REOPEN
pub fn init_logging(config: &ServerConfig) -> Result<LogOutput> {
    let level = config.log_level.to_tracing_level();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("pulsar={}", level)))
        .map_err(|e| ServerError::Config(format!("failed to create log filter: {}", e)))?;

    let output = match config.log_file {
        Some(ref path) => {
            let output = LogOutput::file(path)
                .map_err(|e| ServerError::Config(format!("failed to open error log: {}", e)))?;

            let fmt_layer = fmt::layer()
                .with_writer(output.clone())
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(false)
                .json();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();

            output
        }
        None => {
            let output = LogOutput::stderr();

            let fmt_layer = fmt::layer()
                .with_writer(output.clone())
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_span_events(FmtSpan::NONE)
                .compact();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();

            output
        }
    };

    Ok(output)
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pulsar=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn test_file_sink_writes_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("error.log");

        let output = LogOutput::file(&path).unwrap();
        let mut writer = output.make_writer();
        writer.write_all(b"first\n").unwrap();
        writer.flush().unwrap();

        // Rotate the file away, then reopen
        let rotated = dir.path().join("error.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        output.reopen().unwrap();

        let mut writer = output.make_writer();
        writer.write_all(b"second\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read(&rotated).unwrap(), b"first\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"second\n");
    }

    #[test]
    fn test_reopen_without_rotation_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("error.log");

        let output = LogOutput::file(&path).unwrap();
        let mut writer = output.make_writer();
        writer.write_all(b"stable\n").unwrap();
        writer.flush().unwrap();

        output.reopen().unwrap();
        output.reopen().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"stable\n");
    }

    #[test]
    fn test_stderr_sink_has_no_path() {
        init_test_logging();
        let output = LogOutput::stderr();
        assert!(output.path().is_none());
        assert!(output.reopen().is_ok());
    }

    #[test]
    fn test_retarget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("error.log");

        let output = LogOutput::stderr();
        output.retarget(Some(&path)).unwrap();
        assert_eq!(output.path().unwrap(), path);

        output.retarget(None).unwrap();
        assert!(output.path().is_none());
    }
}
