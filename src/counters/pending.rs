//! Sharded accumulator for increments that cannot reach a file yet.
//!
//! This is the same sharded layout as a plain concurrent counter: each thread
//! adds into its own cache-padded slot, and the total is computed on read.
//! [`Pending::drain`] swaps every shard to zero so the drained amount can be
//! moved into a file slot exactly once.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::counters::{NUM_COMPONENTS, THREAD_SLOT_INDEX};

pub(crate) struct Pending {
    components: [CachePadded<AtomicU64>; NUM_COMPONENTS],
}

impl Pending {
    pub(crate) const fn new() -> Self {
        const ZERO: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));
        Pending {
            components: [ZERO; NUM_COMPONENTS],
        }
    }

    #[inline]
    fn component(&self) -> &AtomicU64 {
        THREAD_SLOT_INDEX.with(|idx| &self.components[*idx])
    }

    /// Adds to the current thread's shard.
    #[inline]
    pub(crate) fn add(&self, value: u64) {
        self.component().fetch_add(value, Ordering::Relaxed);
    }

    /// Sum of all shards.
    #[inline]
    pub(crate) fn total(&self) -> u64 {
        self.components
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .fold(0u64, u64::wrapping_add)
    }

    /// Takes the buffered total, leaving every shard at zero.
    ///
    /// Concurrent adds land either in the returned amount or in the next one.
    #[inline]
    pub(crate) fn drain(&self) -> u64 {
        self.components
            .iter()
            .map(|c| c.swap(0, Ordering::AcqRel))
            .fold(0u64, u64::wrapping_add)
    }
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Pending {
    /// Shows the non-zero shards as `{ [slot]:value ... }`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.components.iter().enumerate() {
            let val = c.load(Ordering::Relaxed);
            if val != 0 {
                write!(f, " [{i}]:{val}")?;
            }
        }
        write!(f, " }}")
    }
}
