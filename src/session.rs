//! The per-process handle on a program's counter directory.
//!
//! A [`Session`] owns the active counter file and hands out counters bound to
//! it. Creating a session touches nothing on disk beyond reading the mode
//! file. [`Session::open`] maps the active file, creating or rotating it as
//! the persisted schedule requires, and moves every buffered increment into
//! it.
//!
//! ```text
//!   Session::new ──► counters buffer in memory
//!        │
//!        ▼ open()
//!   lock dir ──► load schedule ──► expired? ──yes──► next file + schedule
//!        │                              │
//!        │◄─────────────no──────────────┘
//!        ▼
//!   map file ──► publish generation ──► flush buffered counters
//! ```
//!
//! Rotation replaces the active file atomically. Counters notice the new
//! generation on their next increment and rebind.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use arc_swap::{ArcSwapOption, Guard};
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, Mode};
use crate::counters::counter::Shared;
use crate::counters::{Counter, DropReason, Outcome, StackCounter};
use crate::error::{Error, Result};
use crate::file::mapped::MappedFile;
use crate::file::naming::whole_seconds;
use crate::file::{self, first_expiry, next_expiry, CounterFile, ProgramIdentity, ScheduleState};
use crate::names;

/// The file currently receiving increments.
pub(crate) struct ActiveFile {
    /// Increases with every file a session maps.
    pub(crate) generation: u64,
    pub(crate) file: MappedFile,
    pub(crate) expiry: SystemTime,
}

struct Inner {
    config: Config,
    identity: ProgramIdentity,
    mode: Mode,
    enabled: AtomicBool,
    active: ArcSwapOption<ActiveFile>,
    generation: AtomicU64,
    open_lock: Mutex<()>,
    registry: Mutex<Vec<Weak<Shared>>>,
    pending: Mutex<HashMap<String, u64>>,
}

/// Exclusive lock on a program's files, shared across processes.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::io(path, err))?;
        file.lock_exclusive().map_err(|err| Error::io(path, err))?;
        Ok(DirLock { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(error = %err, "failed to release counter directory lock");
        }
    }
}

/// A program's counting session.
///
/// Cheap to clone; clones share the active file and the counter registry.
///
/// # Examples
///
/// ```rust
/// use conteggi::config::{Config, Mode};
/// use conteggi::session::Session;
///
/// let dir = tempfile::tempdir().unwrap();
/// let session = Session::new(Config::new("demo").with_dir(dir.path()).with_mode(Mode::Local));
/// session.open().unwrap();
///
/// session.inc("started");
/// let file = session.read_active().unwrap().unwrap();
/// assert_eq!(file.counts["started"], 1);
/// assert_eq!(file.meta("Program"), Some("demo"));
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Creates a session. Reads the mode file unless `config` forces a mode.
    pub fn new(config: Config) -> Self {
        let mode = config.resolve_mode();
        let identity = config.identity();
        debug!(program = %identity.program, version = %identity.version, %mode, "counting session created");
        Session {
            inner: Arc::new(Inner {
                config,
                identity,
                mode,
                enabled: AtomicBool::new(mode.is_enabled()),
                active: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
                open_lock: Mutex::new(()),
                registry: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The program identity used for file names and metadata.
    pub fn identity(&self) -> &ProgramIdentity {
        &self.inner.identity
    }

    /// The mode resolved when the session was created.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Returns `true` if increments are being recorded.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Pauses or resumes counting for this process.
    ///
    /// Has no effect when the mode is [`Mode::Off`].
    pub fn set_enabled(&self, enabled: bool) {
        self.inner
            .enabled
            .store(enabled && self.inner.mode.is_enabled(), Ordering::Relaxed);
    }

    /// Returns `true` once a counter file is mapped.
    pub fn is_open(&self) -> bool {
        self.inner.active.load().is_some()
    }

    /// Opens the active counter file.
    ///
    /// Rotates first if the persisted schedule has expired. Idempotent: a
    /// session that already has an unexpired file only flushes buffered
    /// increments. Does nothing when the mode is [`Mode::Off`].
    pub fn open(&self) -> Result<()> {
        self.open_at(SystemTime::now())
    }

    /// [`open`](Self::open) with an explicit clock.
    pub fn open_at(&self, now: SystemTime) -> Result<()> {
        self.rotate_at(now).map(|_| ())
    }

    /// Switches to a new counter file if the active one has expired.
    ///
    /// Returns `true` if a file was mapped by this call.
    pub fn rotate(&self) -> Result<bool> {
        self.rotate_at(SystemTime::now())
    }

    /// [`rotate`](Self::rotate) with an explicit clock.
    pub fn rotate_at(&self, now: SystemTime) -> Result<bool> {
        if !self.inner.mode.is_enabled() {
            debug!("telemetry is off, not opening a counter file");
            return Ok(false);
        }

        let _open = self.inner.open_lock.lock();
        let current = self.inner.active.load_full();
        let mapped = match current {
            Some(active) if active.expiry > now => false,
            _ => {
                self.map_active(now)?;
                true
            }
        };
        self.flush();
        Ok(mapped)
    }

    /// Maps the file the schedule designates at `now`. Called with `open_lock` held.
    fn map_active(&self, now: SystemTime) -> Result<()> {
        let identity = &self.inner.identity;
        identity.validate()?;

        let dir = &self.inner.config.dir;
        fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
        let _lock = DirLock::acquire(&dir.join(identity.lock_file_name()))?;

        let now = whole_seconds(now);
        let schedule_path = dir.join(identity.schedule_file_name());
        let state = match ScheduleState::load(&schedule_path)? {
            Some(state) if state.expiry > now => state,
            previous => {
                let expiry = match &previous {
                    Some(previous) => next_expiry(previous.expiry, now),
                    None => first_expiry(now, &mut rand::rng()),
                };
                let state = ScheduleState {
                    file: identity.count_file_name(now),
                    expiry,
                };
                state.store(&schedule_path)?;
                if let Some(previous) = previous {
                    info!(expired = %previous.file, next = %state.file, "counter file rotated");
                }
                state
            }
        };

        let path = dir.join(&state.file);
        let file = MappedFile::open_or_create(&path, &identity.meta(now, state.expiry))?;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.active.store(Some(Arc::new(ActiveFile {
            generation,
            file,
            expiry: state.expiry,
        })));
        info!(path = %path.display(), expiry = %file::naming::format_time(state.expiry), generation, "counter file active");
        Ok(())
    }

    /// Moves buffered increments of live counters into the active file.
    fn flush(&self) {
        let active = self.inner.active.load();
        let Some(active) = &*active else {
            return;
        };

        let counters: Vec<Arc<Shared>> = {
            let mut registry = self.inner.registry.lock();
            registry.retain(|counter| counter.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        for counter in counters {
            if let Err(err) = counter.bind(active) {
                warn!(error = %err, "cannot bind counter to the active file");
            }
        }

        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for (name, delta) in pending {
            match active.file.slot(&name) {
                Ok(slot) => slot.add(delta),
                Err(err) => warn!(counter = %name, error = %err, "dropping buffered increments"),
            }
        }
    }

    pub(crate) fn active_file(&self) -> Guard<Option<Arc<ActiveFile>>> {
        self.inner.active.load()
    }

    fn register(&self, counter: &Arc<Shared>) {
        let mut registry = self.inner.registry.lock();
        if registry.len() == registry.capacity() {
            registry.retain(|counter| counter.strong_count() > 0);
        }
        registry.push(Arc::downgrade(counter));
    }

    /// Returns a counter named `name`.
    ///
    /// Handles for the same name are independent but update the same value.
    pub fn counter(&self, name: impl Into<String>) -> Counter {
        let counter = Counter::new(self.clone(), name.into());
        self.register(counter.shared());
        counter
    }

    /// Returns a stack counter named `name` that records `depth` caller frames.
    ///
    /// `depth` is clamped to [`MAX_STACK_DEPTH`](crate::symbolize::MAX_STACK_DEPTH).
    pub fn stack_counter(&self, name: impl Into<String>, depth: usize) -> StackCounter {
        StackCounter::new(self.clone(), name.into(), depth)
    }

    /// Adds one to the counter `name` without keeping a handle.
    pub fn inc(&self, name: &str) -> Outcome {
        self.add(name, 1)
    }

    /// Adds `delta` to the counter `name` without keeping a handle.
    ///
    /// Looks the name up on every call. Prefer [`counter`](Self::counter) on
    /// hot paths.
    pub fn add(&self, name: &str, delta: u64) -> Outcome {
        if !self.is_enabled() {
            return Outcome::Disabled;
        }
        if names::check(name).is_err() {
            return Outcome::Dropped(DropReason::NameTooLong);
        }

        let active = self.active_file();
        if let Some(active) = &*active {
            return match active.file.slot(name) {
                Ok(slot) => {
                    slot.add(delta);
                    Outcome::Recorded
                }
                Err(err) => {
                    debug!(counter = %name, error = %err, "dropping increment");
                    Outcome::Dropped(DropReason::Storage)
                }
            };
        }

        *self.inner.pending.lock().entry(name.to_string()).or_default() += delta;
        // A concurrent open may have flushed before the insert.
        if self.active_file().is_some() {
            let _open = self.inner.open_lock.lock();
            self.flush();
        }
        Outcome::Recorded
    }

    /// Path of the active counter file.
    pub fn active_path(&self) -> Option<PathBuf> {
        (*self.active_file())
            .as_ref()
            .map(|active| active.file.path().to_path_buf())
    }

    /// Expiry of the active counter file.
    pub fn expiry(&self) -> Option<SystemTime> {
        (*self.active_file()).as_ref().map(|active| active.expiry)
    }

    /// Decodes the active counter file, if one is mapped.
    pub fn read_active(&self) -> Result<Option<CounterFile>> {
        self.active_path()
            .map(|path| file::read_counter_file(&path))
            .transpose()
    }

    /// Counter files of this program whose `TimeEnd` is not after `now`.
    ///
    /// Files that cannot be decoded are logged and skipped, as are files of
    /// other programs sharing the directory.
    pub fn expired_files(&self, now: SystemTime) -> Result<Vec<PathBuf>> {
        let dir = &self.inner.config.dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::io(dir, err)),
        };

        let stem = format!("{}-", self.inner.identity.stem());
        let mut expired = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| Error::io(dir, err))?.path();
            let own = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&stem));
            if !own || !file::is_counter_file(&path) {
                continue;
            }

            match file::read_counter_file(&path) {
                Ok(counts) => match counts.time_end() {
                    Some(end) if end <= now => expired.push(path),
                    Some(_) => {}
                    None => warn!(path = %path.display(), "counter file has no expiry"),
                },
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable counter file"),
            }
        }
        expired.sort();
        Ok(expired)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.inner.identity)
            .field("mode", &self.inner.mode)
            .field("enabled", &self.is_enabled())
            .field("active", &self.active_path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::naming::parse_time;
    use crate::file::ROTATION_PERIOD;

    fn session(dir: &Path) -> Session {
        Session::new(
            Config::new("demo")
                .with_version("1.0")
                .with_dir(dir)
                .with_mode(Mode::Local),
        )
    }

    fn at(text: &str) -> SystemTime {
        parse_time(text).unwrap()
    }

    #[test]
    fn test_new_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir.path().join("counters"));
        session.inc("early");
        assert!(!session.is_open());
        assert!(!dir.path().join("counters").exists());
    }

    #[test]
    fn test_open_creates_file_and_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let now = at("2026-10-16T10:00:00Z");
        session.open_at(now).unwrap();

        let path = session.active_path().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("demo@1.0-"));
        assert!(name.ends_with("-2026-10-16.v1.count"));

        let expiry = session.expiry().unwrap();
        assert!(expiry > now + ROTATION_PERIOD);
        assert!(expiry < now + 2 * ROTATION_PERIOD);

        let state = ScheduleState::load(&dir.path().join(session.identity().schedule_file_name()))
            .unwrap()
            .unwrap();
        assert_eq!(state.expiry, expiry);
        assert_eq!(dir.path().join(&state.file), path);

        let file = session.read_active().unwrap().unwrap();
        assert_eq!(file.time_end(), Some(expiry));
        assert_eq!(file.time_begin(), Some(now));
        assert_eq!(file.meta("Version"), Some("1.0"));
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let now = at("2026-10-16T10:00:00Z");
        assert!(session.rotate_at(now).unwrap());
        let path = session.active_path();
        assert!(!session.rotate_at(now).unwrap());
        session.open_at(now).unwrap();
        assert_eq!(session.active_path(), path);
    }

    #[test]
    fn test_processes_share_the_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let now = at("2026-10-16T10:00:00Z");
        let a = session(dir.path());
        let b = session(dir.path());
        a.open_at(now).unwrap();
        b.open_at(now + ROTATION_PERIOD / 7).unwrap();

        assert_eq!(a.active_path(), b.active_path());
        a.inc("shared");
        b.inc("shared");
        assert_eq!(a.read_active().unwrap().unwrap().counts["shared"], 2);
    }

    #[test]
    fn test_rotation_keeps_weekly_phase() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let now = at("2026-10-16T10:00:00Z");
        session.open_at(now).unwrap();
        session.inc("before");
        let first_path = session.active_path().unwrap();
        let first_expiry = session.expiry().unwrap();

        assert!(!session.rotate_at(first_expiry - ROTATION_PERIOD / 7).unwrap());
        assert!(session.rotate_at(first_expiry).unwrap());
        assert_eq!(session.expiry(), Some(first_expiry + ROTATION_PERIOD));
        assert_ne!(session.active_path().unwrap(), first_path);

        session.inc("after");
        let second = session.read_active().unwrap().unwrap();
        assert!(!second.counts.contains_key("before"));
        assert_eq!(second.counts["after"], 1);
        assert_eq!(file::read_counter_file(&first_path).unwrap().counts["before"], 1);
    }

    #[test]
    fn test_rotation_after_long_gap() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        session.open_at(at("2026-10-16T10:00:00Z")).unwrap();
        let first_expiry = session.expiry().unwrap();

        let later = first_expiry + ROTATION_PERIOD * 5 + ROTATION_PERIOD / 3;
        assert!(session.rotate_at(later).unwrap());
        assert_eq!(session.expiry(), Some(first_expiry + ROTATION_PERIOD * 6));
    }

    #[test]
    fn test_counters_follow_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        session.open_at(at("2026-10-16T10:00:00Z")).unwrap();
        let counter = session.counter("c");
        counter.add(2);

        session.rotate_at(session.expiry().unwrap()).unwrap();
        counter.add(5);
        assert_eq!(counter.value(), 5);
        assert_eq!(session.read_active().unwrap().unwrap().counts["c"], 5);
    }

    #[test]
    fn test_by_name_buffered_until_open() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        assert_eq!(session.add("queued", 4), Outcome::Recorded);
        session.open().unwrap();
        assert_eq!(session.read_active().unwrap().unwrap().counts["queued"], 4);
    }

    #[test]
    fn test_mode_off() {
        let dir = tempfile::tempdir().unwrap();
        Mode::Off.store(dir.path()).unwrap();
        let session = Session::new(Config::new("demo").with_dir(dir.path()));

        assert_eq!(session.mode(), Mode::Off);
        assert!(!session.is_enabled());
        assert_eq!(session.inc("x"), Outcome::Disabled);
        assert!(!session.rotate().unwrap());
        assert!(!session.is_open());

        session.set_enabled(true);
        assert!(!session.is_enabled());
    }

    #[test]
    fn test_set_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        session.open().unwrap();
        session.set_enabled(false);
        assert_eq!(session.inc("x"), Outcome::Disabled);
        session.set_enabled(true);
        assert_eq!(session.inc("x"), Outcome::Recorded);
    }

    #[test]
    fn test_long_name_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        assert_eq!(
            session.inc(&"x".repeat(names::MAX_NAME_LEN + 1)),
            Outcome::Dropped(DropReason::NameTooLong)
        );
    }

    #[test]
    fn test_invalid_identity() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            Config::new("bad/name")
                .with_dir(dir.path())
                .with_mode(Mode::Local),
        );
        assert!(matches!(session.open(), Err(Error::Config(_))));
    }

    #[test]
    fn test_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let now = at("2026-10-16T10:00:00Z");
        session.open_at(now).unwrap();
        let first = session.active_path().unwrap();
        let first_expiry = session.expiry().unwrap();

        assert!(session.expired_files(now).unwrap().is_empty());

        session.rotate_at(first_expiry).unwrap();
        fs::write(dir.path().join("demo@1.0-garbage.v1.count"), b"nope").unwrap();
        fs::write(dir.path().join("other@1.0-x.v1.count"), b"nope").unwrap();

        assert_eq!(session.expired_files(first_expiry).unwrap(), vec![first]);
    }

    #[test]
    fn test_expired_files_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir.path().join("absent"));
        assert!(session.expired_files(SystemTime::now()).unwrap().is_empty());
    }
}
