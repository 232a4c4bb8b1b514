//! Per-process diagnostic log of the upload worker.
//!
//! The worker runs detached with its standard streams closed, so anything
//! worth knowing about its run goes to `<tmp>/conteggi-<pid>.log`. The file is
//! created on the first event only; a quiet run leaves nothing behind.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::dispatcher::{self, Dispatch};
use tracing::Level;

/// Where and how the worker logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticLog {
    path: PathBuf,
}

impl DiagnosticLog {
    /// The log of the current process, in the system temporary directory.
    pub fn for_current_process() -> Self {
        Self::in_dir(std::env::temp_dir(), std::process::id())
    }

    /// The log of process `pid` in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>, pid: u32) -> Self {
        DiagnosticLog {
            path: dir.as_ref().join(format!("conteggi-{pid}.log")),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dispatch(&self) -> Dispatch {
        let path = self.path.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(Level::DEBUG)
            .with_writer(move || LogWriter::open(&path))
            .finish();
        Dispatch::new(subscriber)
    }

    /// Runs `f` with every `tracing` event routed to the log file.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use conteggi::upload::DiagnosticLog;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let log = DiagnosticLog::in_dir(dir.path(), 42);
    /// log.scope(|| tracing::info!("uploaded"));
    ///
    /// let text = std::fs::read_to_string(log.path()).unwrap();
    /// assert!(text.contains("uploaded"));
    /// ```
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        dispatcher::with_default(&self.dispatch(), f)
    }
}

/// Appends to the log file, or discards output if it cannot be opened.
enum LogWriter {
    File(File),
    Sink,
}

impl LogWriter {
    fn open(path: &Path) -> Self {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_or(LogWriter::Sink, LogWriter::File)
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogWriter::File(file) => file.write(buf),
            LogWriter::Sink => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogWriter::File(file) => file.flush(),
            LogWriter::Sink => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, warn};

    #[test]
    fn test_quiet_run_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DiagnosticLog::in_dir(dir.path(), 7);
        assert_eq!(log.scope(|| 1 + 1), 2);
        assert!(!log.path().exists());
    }

    #[test]
    fn test_events_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = DiagnosticLog::in_dir(dir.path(), 7);
        log.scope(|| info!(files = 2, "first run"));
        log.scope(|| warn!("second run"));

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("first run"));
        assert!(text.contains("files=2"));
        assert!(text.contains("second run"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn test_named_by_pid() {
        let log = DiagnosticLog::in_dir("/tmp", 1234);
        assert_eq!(log.path(), Path::new("/tmp/conteggi-1234.log"));
    }

    #[test]
    fn test_unwritable_dir_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = DiagnosticLog::in_dir(dir.path().join("missing"), 7);
        log.scope(|| info!("dropped"));
        assert!(!log.path().exists());
    }
}
