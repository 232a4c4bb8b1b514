//! Observers rendering counters for people.
//!
//! - [`table`] - Pretty-print counters and counter files as tables using the
//!   `tabled` crate (feature `table`)
//!
//! Machine-readable output is the [`Report`](crate::upload::Report), which
//! serializes with `serde` under the `json` feature.

#[cfg(feature = "table")]
pub mod table;
