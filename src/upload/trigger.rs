//! Launching the upload worker from the host program.
//!
//! The worker is the host executable itself, re-run with
//! [`UPLOAD_SENTINEL`] as its only argument. [`UploadTrigger::run`] is meant
//! to wrap the body of `main`: in the host it starts the worker once and
//! runs the host; in the worker it reports and returns without running the
//! host.
//!
//! ```text
//!   host main ──► UploadTrigger::run ──► spawn "<exe> __conteggi_upload__"
//!       │                                            │ detached
//!       ▼                                            ▼
//!   host body                             UploadTrigger::run ──► run_worker
//! ```

use std::ffi::OsStr;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::Error;
use crate::session::Session;
use crate::upload::diagnostic::DiagnosticLog;
use crate::upload::report::Reporter;
use crate::upload::worker::run_worker;

/// The argument that turns a host executable into the upload worker.
pub const UPLOAD_SENTINEL: &str = "__conteggi_upload__";

/// Which part the current process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The program the user started.
    Host,
    /// A detached copy of it, started to report counter files.
    Worker,
}

impl Role {
    /// Detects the role from the full argument list, program name included.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use conteggi::upload::{Role, UPLOAD_SENTINEL};
    ///
    /// assert_eq!(Role::detect(["demo", UPLOAD_SENTINEL]), Role::Worker);
    /// assert_eq!(Role::detect(["demo", UPLOAD_SENTINEL, "--verbose"]), Role::Host);
    /// assert_eq!(Role::detect(["demo"]), Role::Host);
    /// ```
    pub fn detect<I, S>(args: I) -> Role
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args = args.into_iter().skip(1);
        match (args.next(), args.next()) {
            (Some(arg), None) if arg.as_ref() == UPLOAD_SENTINEL => Role::Worker,
            _ => Role::Host,
        }
    }
}

/// Starts detached processes.
#[cfg_attr(test, mockall::automock)]
pub trait Spawner: Debug + Send + Sync {
    /// Starts `program arg` without waiting for it and without sharing the
    /// caller's standard streams.
    fn spawn_detached(&self, program: &Path, arg: &OsStr) -> io::Result<()>;
}

/// Spawns real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn_detached(&self, program: &Path, arg: &OsStr) -> io::Result<()> {
        let mut command = Command::new(program);
        command
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);

        let mut child = command.spawn()?;
        let pid = child.id();
        // Reap the worker if it exits while the host is still running.
        let reaper = thread::Builder::new()
            .name("conteggi-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, %status, "upload worker exited"),
                Err(err) => debug!(pid, error = %err, "failed to wait for upload worker"),
            });
        if let Err(err) = reaper {
            debug!(pid, error = %err, "worker started without a reaper");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

/// Starts the upload worker at most once per trigger.
#[derive(Debug)]
pub struct UploadTrigger<S: Spawner = ProcessSpawner> {
    spawner: S,
    program: Option<PathBuf>,
    diagnostics: DiagnosticLog,
    spawned: AtomicBool,
}

impl UploadTrigger<ProcessSpawner> {
    /// The process-wide trigger, spawning real processes.
    pub fn global() -> &'static UploadTrigger {
        static GLOBAL: OnceLock<UploadTrigger> = OnceLock::new();
        GLOBAL.get_or_init(|| UploadTrigger::new(ProcessSpawner))
    }
}

impl<S: Spawner> UploadTrigger<S> {
    /// A trigger launching workers through `spawner`.
    pub fn new(spawner: S) -> Self {
        UploadTrigger {
            spawner,
            program: None,
            diagnostics: DiagnosticLog::for_current_process(),
            spawned: AtomicBool::new(false),
        }
    }

    /// Runs `program` as the worker instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Logs worker runs and spawn failures to `diagnostics`.
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticLog) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Returns `true` once a spawn has been attempted.
    pub fn has_spawned(&self) -> bool {
        self.spawned.load(Ordering::Acquire)
    }

    /// Entry point wrapping the host's `main`.
    ///
    /// In the worker, reports expired files and returns `None` without
    /// calling `host`. In the host, starts the worker (once) and returns
    /// `Some` with the result of `host`.
    pub fn run<I, A, F, R>(&self, args: I, session: &Session, reporter: &dyn Reporter, host: F) -> Option<R>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
        F: FnOnce() -> R,
    {
        match Role::detect(args) {
            Role::Worker => {
                self.diagnostics.scope(|| {
                    let summary = run_worker(session, reporter, SystemTime::now());
                    debug!(reported = summary.reported, failed = summary.failed, "upload worker done");
                });
                None
            }
            Role::Host => {
                self.spawn_worker(session);
                Some(host())
            }
        }
    }

    /// Starts the worker unless telemetry is off or a worker was already
    /// started by this trigger.
    ///
    /// Returns `true` if this call launched it. A failed launch is logged to
    /// the diagnostic log and not retried.
    pub fn spawn_worker(&self, session: &Session) -> bool {
        if !session.mode().is_enabled() {
            return false;
        }
        if self.spawned.swap(true, Ordering::AcqRel) {
            return false;
        }

        let program = match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        };
        let launched = program
            .and_then(|program| self.spawner.spawn_detached(&program, OsStr::new(UPLOAD_SENTINEL)))
            .map_err(Error::Spawn);

        match launched {
            Ok(()) => {
                debug!("upload worker started");
                true
            }
            Err(err) => {
                self.diagnostics
                    .scope(|| warn!(error = %err, "upload worker not started"));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Mode};
    use crate::error::Result;
    use crate::file::CounterFile;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct NoReports;

    impl Reporter for NoReports {
        fn report(&self, _path: &Path, _file: &CounterFile) -> Result<()> {
            Ok(())
        }
    }

    fn session(dir: &Path, mode: Mode) -> Session {
        Session::new(Config::new("demo").with_dir(dir).with_mode(mode))
    }

    fn trigger(spawner: MockSpawner, dir: &Path) -> UploadTrigger<MockSpawner> {
        UploadTrigger::new(spawner)
            .with_program("/usr/bin/demo")
            .with_diagnostics(DiagnosticLog::in_dir(dir, 1))
    }

    #[test]
    fn test_host_spawns_worker_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut spawner = MockSpawner::new();
        spawner
            .expect_spawn_detached()
            .withf(|program, arg| program == Path::new("/usr/bin/demo") && arg == UPLOAD_SENTINEL)
            .times(1)
            .returning(|_, _| Ok(()));
        let trigger = trigger(spawner, dir.path());
        let session = session(dir.path(), Mode::Local);

        assert_eq!(trigger.run(["demo"], &session, &NoReports, || 7), Some(7));
        assert_eq!(trigger.run(["demo", "-v"], &session, &NoReports, || 8), Some(8));
        assert!(trigger.has_spawned());
    }

    #[test]
    fn test_worker_never_runs_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut spawner = MockSpawner::new();
        spawner.expect_spawn_detached().never();
        let trigger = trigger(spawner, dir.path());
        let session = session(dir.path(), Mode::Local);

        let ran = AtomicUsize::new(0);
        let result = trigger.run(["demo", UPLOAD_SENTINEL], &session, &NoReports, || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(result, None);
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert!(!trigger.has_spawned());
    }

    #[test]
    fn test_mode_off_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut spawner = MockSpawner::new();
        spawner.expect_spawn_detached().never();
        let trigger = trigger(spawner, dir.path());
        let session = session(dir.path(), Mode::Off);

        assert_eq!(trigger.run(["demo"], &session, &NoReports, || 1), Some(1));
        assert!(!trigger.spawn_worker(&session));
    }

    #[test]
    fn test_spawn_failure_is_logged_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut spawner = MockSpawner::new();
        spawner
            .expect_spawn_detached()
            .withf(|program, arg| program == Path::new("/usr/bin/demo") && arg == UPLOAD_SENTINEL)
            .times(1)
            .returning(|_, _| Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        let trigger = trigger(spawner, dir.path());
        let session = session(dir.path(), Mode::On);

        assert!(!trigger.spawn_worker(&session));
        assert!(!trigger.spawn_worker(&session));

        let log = std::fs::read_to_string(dir.path().join("conteggi-1.log")).unwrap();
        assert!(log.contains("upload worker not started"));
    }

    #[test]
    fn test_concurrent_hosts_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut spawner = MockSpawner::new();
        spawner
            .expect_spawn_detached()
            .times(1)
            .returning(|_, _| Ok(()));
        let trigger = Arc::new(trigger(spawner, dir.path()));
        let session = session(dir.path(), Mode::Local);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let trigger = Arc::clone(&trigger);
                let session = session.clone();
                std::thread::spawn(move || trigger.spawn_worker(&session))
            })
            .collect();
        let launched = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|launched| *launched)
            .count();
        assert_eq!(launched, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_spawner_detaches_and_reaps() {
        let spawner = ProcessSpawner;
        spawner
            .spawn_detached(Path::new("true"), OsStr::new(UPLOAD_SENTINEL))
            .unwrap();
        let missing = spawner.spawn_detached(Path::new("/nonexistent/conteggi-host"), OsStr::new(UPLOAD_SENTINEL));
        assert_eq!(missing.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(UploadTrigger::global(), UploadTrigger::global()));
    }
}
