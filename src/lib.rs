//! # Conteggi - Local Usage Counters with Weekly Reports
//!
//! A Rust library for counting how a program is used, on the machine it runs
//! on. Counters live in a memory-mapped file shared by every process of the
//! program, so an increment is a single atomic add into the page cache: no
//! syscall, no lock, no background thread.
//!
//! ## The Model
//!
//! - A **counter** is a name and a monotonically increasing `u64`.
//! - A **stack counter** keeps one counter per distinct call stack of its
//!   caller, named after the functions and build-stable line offsets on it.
//! - Counters accumulate in a **counter file** covering about a week. When it
//!   expires, the next process to open the directory starts a new one.
//! - Expired files are handed to a **reporter** by a detached copy of the
//!   program, so reporting never runs inside the host.
//! - A per-directory **mode** (`off`, `local`, `on`) is the user's switch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐        ┌──────────────────────────────┐
//! │  process A   │   │  process B   │        │ <dir>/demo@1.0-...v1.count   │
//! │  Counter ────┼───┼──────────────┼─mmap──►│ header │ buckets │ records... │
//! │  StackCounter│   │  Counter ────┼─mmap──►│        (MAP_SHARED, atomics)  │
//! └──────┬───────┘   └──────────────┘        └──────────────────────────────┘
//!        │ spawn once                                       │ expired
//!        ▼                                                  ▼
//! ┌──────────────────────────┐  run_worker()  ┌──────────────────────────────┐
//! │ demo __conteggi_upload__ │───────────────►│ Reporter (e.g. LocalReporter)│
//! └──────────────────────────┘                └──────────────────────────────┘
//! ```
//!
//! ## Design Principles
//!
//! 1. **Increments never fail loudly**: every increment returns an
//!    [`Outcome`](counters::Outcome). Storage problems are logged once with
//!    `tracing` and the increment is dropped.
//!
//! 2. **Nothing happens before `open`**: a [`Session`](session::Session)
//!    performs no file I/O until [`Session::open`](session::Session::open).
//!    Earlier increments are buffered in sharded, cache-padded accumulators
//!    and moved into the file when it is mapped.
//!
//! 3. **Cross-process by construction**: records are created with
//!    compare-and-swap on the shared mapping, so any number of processes of
//!    the same program converge on one record per name.
//!
//! 4. **Stable stack names**: a frame is named `function:line - entry line`,
//!    which does not move when unrelated code above the function changes.
//!
//! ## Quick Start
//!
//! ```rust
//! use conteggi::config::{Config, Mode};
//! use conteggi::session::Session;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let session = Session::new(
//!     Config::new("demo")
//!         .with_version("1.0")
//!         .with_dir(dir.path())
//!         .with_mode(Mode::Local),
//! );
//!
//! let saved = session.counter("file/saved");
//! let lookups = session.stack_counter("lookup", 3);
//!
//! session.open().unwrap();
//! saved.inc();
//! lookups.inc();
//!
//! let file = session.read_active().unwrap().unwrap();
//! assert_eq!(file.counts["file/saved"], 1);
//! for (name, value) in file.stacks() {
//!     println!("{value:>6} {}", name.replace('\n', " < "));
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Enables |
//! |---------|---------|
//! | `serde` | `Serialize`/`Deserialize` for [`CounterFile`](file::CounterFile) and [`Report`](upload::Report) |
//! | `json` (default) | [`LocalReporter`](upload::LocalReporter), JSON reports on disk |
//! | `table` | [`observers::table`], table rendering of counters and files |
//! | `full` | `table` and `json` |
//! | `cli` | the `conteggi` inspection tool |

pub mod config;
pub mod counters;
pub mod error;
pub mod file;
pub mod names;
pub mod observers;
pub mod session;
pub mod symbolize;
pub mod upload;

pub use config::{Config, Mode};
pub use counters::{Counter, Outcome, StackCounter};
pub use error::{Error, Result};
pub use session::Session;
