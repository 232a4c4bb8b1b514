//! Counters keyed by the call stack of their caller.
//!
//! A [`StackCounter`] answers "from where is this called, and how often?".
//! Each distinct call stack, up to the configured depth, gets its own
//! [`Counter`] whose name is built from the base name and one
//! `function:relative-line` location per frame (see [`crate::names`]).
//!
//! The hot path only captures raw addresses and scans the table of known
//! stacks. Symbol resolution runs once per new stack, under the table lock.
//!
//! # Example
//!
//! ```rust
//! use conteggi::config::{Config, Mode};
//! use conteggi::session::Session;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let session = Session::new(Config::new("demo").with_dir(dir.path()).with_mode(Mode::Local));
//! session.open().unwrap();
//!
//! let calls = session.stack_counter("parse", 2);
//! for _ in 0..3 {
//!     calls.inc();
//! }
//! let total: u64 = calls.counters().iter().map(|c| c.value()).sum();
//! assert_eq!(total, 3);
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::counters::{Counter, DropReason, Outcome};
use crate::error::StackWalkError;
use crate::names::{self, NameTooLong, UNKNOWN_LOCATION};
use crate::session::Session;
use crate::symbolize::{self, BacktraceSymbolizer, Frame, StackKey, Symbolize, MAX_STACK_DEPTH};

enum State {
    Counter(Counter),
    Dropped(DropReason),
}

struct Entry {
    frames: Box<[Frame]>,
    state: State,
}

enum NameError {
    TooLong(NameTooLong),
    StackWalk(StackWalkError),
}

/// A family of counters, one per distinct call stack of the caller.
pub struct StackCounter {
    name: String,
    depth: usize,
    session: Session,
    symbolizer: Arc<dyn Symbolize>,
    stacks: Mutex<Vec<Entry>>,
}

impl StackCounter {
    pub(crate) fn new(session: Session, name: String, depth: usize) -> Self {
        StackCounter {
            name,
            depth: depth.min(MAX_STACK_DEPTH),
            session,
            symbolizer: Arc::new(BacktraceSymbolizer),
            stacks: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the symbol resolver.
    pub fn with_symbolizer(mut self, symbolizer: Arc<dyn Symbolize>) -> Self {
        self.symbolizer = symbolizer;
        self
    }

    /// The base name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of caller frames recorded per increment.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Adds one to the counter of the caller's stack.
    #[inline(never)]
    pub fn inc(&self) -> Outcome {
        if !self.session.is_enabled() {
            return Outcome::Disabled;
        }
        let key = symbolize::capture(self.depth, Self::inc as fn(&Self) -> Outcome as usize);
        self.record(&key)
    }

    /// Adds one to the counter of an already captured stack.
    pub fn record(&self, key: &StackKey) -> Outcome {
        if !self.session.is_enabled() {
            return Outcome::Disabled;
        }

        let counter = {
            let mut stacks = self.stacks.lock();
            match stacks.iter().find(|entry| key.matches(&entry.frames)) {
                Some(Entry {
                    state: State::Counter(counter),
                    ..
                }) => counter.clone(),
                Some(Entry {
                    state: State::Dropped(reason),
                    ..
                }) => return Outcome::Dropped(*reason),
                None => match self.composite_name(key) {
                    Ok(name) => {
                        let counter = self.session.counter(name);
                        stacks.push(Entry {
                            frames: key.frames().into(),
                            state: State::Counter(counter.clone()),
                        });
                        counter
                    }
                    Err(NameError::TooLong(err)) => {
                        debug!(counter = %self.name, error = %err, "stack name too long, dropping stack");
                        stacks.push(Entry {
                            frames: key.frames().into(),
                            state: State::Dropped(DropReason::NameTooLong),
                        });
                        return Outcome::Dropped(DropReason::NameTooLong);
                    }
                    Err(NameError::StackWalk(err)) => {
                        warn!(counter = %self.name, error = %err, "inconsistent stack, dropping increment");
                        return Outcome::Dropped(DropReason::StackWalk);
                    }
                },
            }
        };
        counter.inc()
    }

    fn composite_name(&self, key: &StackKey) -> Result<String, NameError> {
        let locations = key
            .frames()
            .iter()
            .map(|frame| match self.symbolizer.locate(frame) {
                Some(loc) => names::location(
                    &loc.function,
                    names::relative_line(loc.line, loc.entry_line),
                ),
                None => Ok(UNKNOWN_LOCATION.to_string()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(NameError::StackWalk)?;
        names::encode(&self.name, &locations).map_err(NameError::TooLong)
    }

    /// Full names of the stacks seen so far, in first-seen order.
    pub fn names(&self) -> Vec<String> {
        self.counters()
            .iter()
            .map(|counter| counter.name().to_string())
            .collect()
    }

    /// Counters of the stacks seen so far, in first-seen order.
    pub fn counters(&self) -> Vec<Counter> {
        self.stacks
            .lock()
            .iter()
            .filter_map(|entry| match &entry.state {
                State::Counter(counter) => Some(counter.clone()),
                State::Dropped(_) => None,
            })
            .collect()
    }
}

impl Debug for StackCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackCounter")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("stacks", &self.stacks.lock().len())
            .finish()
    }
}
