//! The upload worker: hands expired counter files to a [`Reporter`].

use std::time::SystemTime;

use tracing::{debug, error, info, warn};

use crate::file;
use crate::session::Session;
use crate::upload::report::Reporter;

/// What a worker run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Files accepted by the reporter.
    pub reported: usize,
    /// Files the reporter or the decoder rejected. They are retried next run.
    pub failed: usize,
}

/// Reports every counter file of `session` that expired at `now`.
///
/// Never fails: problems are logged and counted in the summary.
pub fn run_worker(session: &Session, reporter: &dyn Reporter, now: SystemTime) -> WorkerSummary {
    let mut summary = WorkerSummary::default();
    let mode = session.mode();
    if !mode.is_enabled() {
        debug!("telemetry is off, nothing to report");
        return summary;
    }
    if reporter.uploads() && !mode.allows_upload() {
        debug!(%mode, "uploads not allowed, keeping counter files");
        return summary;
    }

    let files = match session.expired_files(now) {
        Ok(files) => files,
        Err(err) => {
            error!(error = %err, "cannot list counter files");
            return summary;
        }
    };
    debug!(count = files.len(), "expired counter files");

    for path in files {
        let reported = file::read_counter_file(&path).and_then(|counts| reporter.report(&path, &counts));
        match reported {
            Ok(()) => {
                summary.reported += 1;
                info!(path = %path.display(), "counter file reported");
            }
            Err(err) => {
                summary.failed += 1;
                warn!(path = %path.display(), error = %err, "counter file not reported");
            }
        }
    }
    summary
}
