//! Counter handles and the vocabulary shared by all of them.
//!
//! Two kinds of counters are provided:
//!
//! | Type | Identity | Backing storage |
//! |------|----------|-----------------|
//! | [`Counter`] | a name | one slot in the active counter file |
//! | [`StackCounter`] | a base name and a depth | one [`Counter`] per distinct call stack |
//!
//! Both are created from a [`Session`](crate::session::Session) and are cheap
//! to call from any thread. Increments never fail loudly. Each one reports an
//! [`Outcome`] that callers are free to ignore and tests can assert on.
//!
//! # Buffering before the file is open
//!
//! Until the session has an active file, increments are kept in a sharded
//! in-memory accumulator and moved into the file on the next opportunity.
//! The sharding follows the usual per-thread slot layout:
//!
//! ```text
//!                          ┌─────────────────────────────────────┐
//!                          │         Pending accumulator         │
//!                          ├─────────────────────────────────────┤
//!   Thread 0 ──writes──►   │ [Slot 0] ████████ (CachePadded)     │
//!   Thread 1 ──writes──►   │ [Slot 1] ████████ (CachePadded)     │
//!        ...               │    ...                              │
//!   Thread 15 ─writes──►   │ [Slot 15] ███████ (CachePadded)     │
//!                          └─────────────────────────────────────┘
//!                                          │
//!                                          ▼
//!                              drained into the file slot
//! ```

pub mod counter;
pub(crate) mod pending;
pub mod stack;

pub use counter::Counter;
pub use stack::StackCounter;

use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of shards used by each pending accumulator.
///
/// Buffering is transient (it only matters until the file is mapped), so
/// this is smaller than what a long-lived hot counter would use.
pub(crate) const NUM_COMPONENTS: usize = 16;

/// Global counter for assigning slot IDs to threads.
static NEXT_SLOT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Slot index assigned to the current thread, stable for its lifetime.
    pub(crate) static THREAD_SLOT_INDEX: usize = next_slot_id();
}

/// Assigns the next slot to a thread, round-robin over [`NUM_COMPONENTS`].
///
/// Two threads sharing a slot only costs contention, never correctness.
fn next_slot_id() -> usize {
    NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed) % NUM_COMPONENTS
}

/// Why an increment was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The counter name (or composite stack name) exceeds
    /// [`MAX_NAME_LEN`](crate::names::MAX_NAME_LEN).
    NameTooLong,
    /// The call stack could not be turned into a consistent name.
    StackWalk,
    /// The active counter file could not be updated.
    Storage,
}

impl Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::NameTooLong => f.write_str("name too long"),
            DropReason::StackWalk => f.write_str("inconsistent stack"),
            DropReason::Storage => f.write_str("storage unavailable"),
        }
    }
}

/// Result of a single increment.
///
/// Telemetry never surfaces errors to the host, so this is informational.
///
/// # Examples
///
/// ```rust
/// use conteggi::counters::{DropReason, Outcome};
///
/// let outcome = Outcome::Dropped(DropReason::NameTooLong);
/// assert!(!outcome.is_recorded());
/// assert_eq!(outcome.to_string(), "dropped: name too long");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The increment was written to the active file or buffered for it.
    Recorded,
    /// Telemetry is disabled; nothing was done.
    Disabled,
    /// The increment was discarded.
    Dropped(DropReason),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Recorded`].
    #[inline]
    pub fn is_recorded(&self) -> bool {
        matches!(self, Outcome::Recorded)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Recorded => f.write_str("recorded"),
            Outcome::Disabled => f.write_str("disabled"),
            Outcome::Dropped(reason) => write!(f, "dropped: {reason}"),
        }
    }
}

/// A trait for counters that can be observed by name and value.
///
/// Implemented by [`Counter`]; used by observers such as the table renderer.
pub trait Observable: Debug {
    /// Returns the full counter name.
    fn name(&self) -> &str;

    /// Returns the current value of the counter.
    fn value(&self) -> u64;
}

impl Display for dyn Observable + '_ {
    /// Formats the counter as `name:value`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name(), self.value())
    }
}
