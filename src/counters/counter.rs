//! A named counter backed by a slot of the active counter file.
//!
//! # Example
//!
//! ```rust
//! use conteggi::config::{Config, Mode};
//! use conteggi::session::Session;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let session = Session::new(Config::new("demo").with_dir(dir.path()).with_mode(Mode::Local));
//!
//! let opened = session.counter("editor/opened");
//! opened.inc(); // buffered: no file yet
//!
//! session.open().unwrap();
//! opened.add(2); // written through the mapping
//! assert_eq!(opened.value(), 3);
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use crate::counters::pending::Pending;
use crate::counters::{DropReason, Observable, Outcome};
use crate::error::{Error, Result};
use crate::file::mapped::Slot;
use crate::names;
use crate::session::{ActiveFile, Session};

/// A file slot, tagged with the generation of the file it belongs to.
struct CachedSlot {
    generation: u64,
    slot: Slot,
}

pub(crate) struct Shared {
    name: String,
    session: Session,
    pending: Pending,
    slot: ArcSwapOption<CachedSlot>,
    warned: AtomicBool,
}

/// A monotonically increasing, named counter.
///
/// Handles are cheap to clone and all clones update the same value. Before
/// the session has an active file, increments are buffered in memory and
/// moved into the file when it is opened. After rotation, the handle moves to
/// the new file on its next increment.
#[derive(Clone)]
pub struct Counter {
    shared: Arc<Shared>,
}

impl Counter {
    pub(crate) fn new(session: Session, name: String) -> Self {
        Counter {
            shared: Arc::new(Shared {
                name,
                session,
                pending: Pending::new(),
                slot: ArcSwapOption::empty(),
                warned: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// The counter name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Adds one.
    #[inline]
    pub fn inc(&self) -> Outcome {
        self.add(1)
    }

    /// Adds `delta`.
    ///
    /// Never fails loudly: the returned [`Outcome`] says whether the
    /// increment was recorded, skipped because telemetry is off, or dropped.
    pub fn add(&self, delta: u64) -> Outcome {
        let shared = &*self.shared;
        if !shared.session.is_enabled() {
            return Outcome::Disabled;
        }
        if names::check(&shared.name).is_err() {
            return Outcome::Dropped(DropReason::NameTooLong);
        }

        let active = shared.session.active_file();
        if let Some(active) = &*active {
            return shared.add_to(active, delta);
        }

        shared.pending.add(delta);
        // The session may have flushed its counters between the check above
        // and the add.
        let active = shared.session.active_file();
        if let Some(active) = &*active {
            let drained = shared.pending.drain();
            if !shared.add_to(active, drained).is_recorded() {
                shared.pending.add(drained);
            }
        }
        Outcome::Recorded
    }

    /// Current value: what the active file holds plus what is still buffered.
    pub fn value(&self) -> u64 {
        let shared = &*self.shared;
        let active = shared.session.active_file();
        let stored = match &*active {
            Some(active) => shared.slot_for(active).map_or(0, |slot| slot.load()),
            None => 0,
        };
        stored.wrapping_add(shared.pending.total())
    }

    /// Increments not yet written to a file.
    pub fn buffered(&self) -> u64 {
        self.shared.pending.total()
    }
}

impl Shared {
    fn add_to(&self, active: &ActiveFile, delta: u64) -> Outcome {
        match self.slot_for(active) {
            Ok(slot) => {
                slot.add(delta);
                Outcome::Recorded
            }
            Err(err) => {
                self.report(&err);
                Outcome::Dropped(DropReason::Storage)
            }
        }
    }

    fn slot_for(&self, active: &ActiveFile) -> Result<Slot> {
        if let Some(cached) = &*self.slot.load() {
            if cached.generation == active.generation {
                return Ok(cached.slot.clone());
            }
        }
        self.bind(active)
    }

    /// Looks up the slot in `active` and moves the buffered increments into it.
    pub(crate) fn bind(&self, active: &ActiveFile) -> Result<Slot> {
        let slot = active.file.slot(&self.name)?;
        let drained = self.pending.drain();
        if drained > 0 {
            slot.add(drained);
        }
        self.slot.store(Some(Arc::new(CachedSlot {
            generation: active.generation,
            slot: slot.clone(),
        })));
        debug!(counter = %self.name, generation = active.generation, "counter bound to file");
        Ok(slot)
    }

    fn report(&self, err: &Error) {
        if self.warned.swap(true, Ordering::Relaxed) {
            debug!(counter = %self.name, error = %err, "dropping increment");
        } else {
            warn!(counter = %self.name, error = %err, "counter file unavailable, dropping increments");
        }
    }
}

impl Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.shared.name)
            .field("buffered", &self.shared.pending)
            .finish()
    }
}

impl Observable for Counter {
    fn name(&self) -> &str {
        Counter::name(self)
    }

    fn value(&self) -> u64 {
        Counter::value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Mode};
    use crate::names::MAX_NAME_LEN;
    use std::thread;

    fn session(dir: &std::path::Path, mode: Mode) -> Session {
        Session::new(Config::new("demo").with_version("1.0").with_dir(dir).with_mode(mode))
    }

    #[test]
    fn test_disabled_counter_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Off);
        let counter = session.counter("c");
        assert_eq!(counter.inc(), Outcome::Disabled);
        assert_eq!(counter.value(), 0);
        session.open().unwrap();
        assert_eq!(counter.inc(), Outcome::Disabled);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_buffered_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Local);
        let counter = session.counter("c");
        assert_eq!(counter.add(3), Outcome::Recorded);
        assert_eq!(counter.buffered(), 3);
        assert_eq!(counter.value(), 3);

        session.open().unwrap();
        assert_eq!(counter.buffered(), 0);
        assert_eq!(counter.value(), 3);
        assert_eq!(session.read_active().unwrap().unwrap().counts["c"], 3);
    }

    #[test]
    fn test_long_name_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Local);
        session.open().unwrap();
        let counter = session.counter("x".repeat(MAX_NAME_LEN + 1));
        assert_eq!(counter.inc(), Outcome::Dropped(DropReason::NameTooLong));
        assert!(session.read_active().unwrap().unwrap().counts.is_empty());
    }

    #[test]
    fn test_clones_share_value() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Local);
        session.open().unwrap();
        let a = session.counter("c");
        let b = a.clone();
        a.inc();
        b.add(4);
        assert_eq!(a.value(), 5);
    }

    #[test]
    fn test_separate_handles_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Local);
        session.open().unwrap();
        session.counter("c").add(2);
        session.counter("c").add(2);
        assert_eq!(session.counter("c").value(), 4);
    }

    #[test]
    fn test_concurrent_increments() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Local);
        let counter = session.counter("c");
        let mut handles = vec![];

        for i in 0..8 {
            let counter = counter.clone();
            let session = session.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    counter.inc();
                }
                if i == 3 {
                    session.open().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        session.open().unwrap();

        assert_eq!(counter.value(), 8000);
        counter.add(0);
        assert_eq!(session.read_active().unwrap().unwrap().counts["c"], 8000);
    }

    #[test]
    fn test_debug_and_observable() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), Mode::Local);
        let counter = session.counter("c");
        counter.add(2);
        assert!(format!("{counter:?}").contains("\"c\""));

        let observable: &dyn Observable = &counter;
        assert_eq!(observable.to_string(), "c:2");
    }
}
