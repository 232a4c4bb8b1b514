//! Out-of-process reporting of expired counter files.
//!
//! Reporting never runs inside the host. The host only launches a detached
//! copy of itself (see [`UploadTrigger`]), which lists the expired files of
//! the program, passes each one to a [`Reporter`], and exits. Everything the
//! worker has to say goes to its [`DiagnosticLog`].
//!
//! # Example
//!
//! ```rust,no_run
//! use conteggi::config::Config;
//! use conteggi::session::Session;
//! use conteggi::upload::{LocalReporter, UploadTrigger};
//!
//! fn main() {
//!     let session = Session::new(Config::new("demo").with_version("1.0"));
//!     let reporter = LocalReporter::for_session(&session);
//!
//!     UploadTrigger::global().run(std::env::args_os(), &session, &reporter, || {
//!         session.open().ok();
//!         session.inc("started");
//!         // ... the program ...
//!     });
//! }
//! ```

pub mod diagnostic;
pub mod report;
pub mod trigger;
pub mod worker;

pub use diagnostic::DiagnosticLog;
#[cfg(feature = "json")]
pub use report::LocalReporter;
pub use report::{Report, Reporter, LOCAL_DIR};
pub use trigger::{ProcessSpawner, Role, Spawner, UploadTrigger, UPLOAD_SENTINEL};
pub use worker::{run_worker, WorkerSummary};
