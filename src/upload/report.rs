//! Reports built from expired counter files, and where they go.
//!
//! The worker hands every expired file to a [`Reporter`]. What happens next
//! is up to the implementation: [`LocalReporter`] keeps a JSON report per
//! program and week under `<dir>/local/` and removes the counter file.
//! Hosts that upload provide their own implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::file::format::META_TIME_END;
use crate::file::naming::date_of;
use crate::file::{CounterFile, ProgramIdentity};

#[cfg(feature = "json")]
use std::fs;
#[cfg(feature = "json")]
use std::path::PathBuf;
#[cfg(feature = "json")]
use tracing::debug;

/// Subdirectory of the counter directory holding local reports.
pub const LOCAL_DIR: &str = "local";

/// Receives expired counter files.
///
/// Returning `Ok` means the file has been taken care of. The implementation
/// is responsible for removing it; a file left in place is offered again on
/// the next run.
pub trait Reporter: Send + Sync {
    /// Reports the counter file at `path`, already decoded as `file`.
    fn report(&self, path: &Path, file: &CounterFile) -> Result<()>;

    /// Returns `true` if reports leave the machine.
    ///
    /// The worker only runs such reporters when the mode is
    /// [`Mode::On`](crate::config::Mode::On).
    fn uploads(&self) -> bool {
        false
    }
}

/// The summary of one program's week.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Report {
    /// Date the counting period ended, `YYYY-MM-DD`.
    pub week: String,
    /// Program name.
    pub program: String,
    /// Program version.
    pub version: String,
    /// Operating system.
    pub os: String,
    /// CPU architecture.
    pub arch: String,
    /// Plain counters.
    pub counters: BTreeMap<String, u64>,
    /// Stack counter entries, keyed by their full name.
    pub stacks: BTreeMap<String, u64>,
    /// File names of the counter files summed into this report.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sources: BTreeSet<String>,
}

impl Report {
    /// Builds the report of the counter file at `path`.
    pub fn from_file(path: &Path, file: &CounterFile) -> Result<Self> {
        let missing = |what: &str| Error::Report {
            path: path.to_path_buf(),
            reason: format!("missing {what} metadata"),
        };
        let identity = ProgramIdentity::from_meta(&file.meta).ok_or_else(|| missing("identity"))?;
        let end = file.time_end().ok_or_else(|| missing(META_TIME_END))?;

        Ok(Report {
            week: date_of(end),
            program: identity.program,
            version: identity.version,
            os: identity.os,
            arch: identity.arch,
            counters: collect(file.counters()),
            stacks: collect(file.stacks()),
            sources: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .into_iter()
                .collect(),
        })
    }

    /// File name of the local copy: `<program>@<version>-<os>-<arch>-<week>.json`.
    pub fn file_name(&self) -> String {
        format!(
            "{}@{}-{}-{}-{}.json",
            self.program, self.version, self.os, self.arch, self.week
        )
    }

    /// Returns `true` if every counter file of `other` is already in `self`.
    pub fn contains(&self, other: &Report) -> bool {
        other.sources.is_subset(&self.sources)
    }

    /// Adds the counts of `other` into `self`.
    pub fn merge(&mut self, other: &Report) {
        self.sources.extend(other.sources.iter().cloned());
        for (name, value) in &other.counters {
            let slot = self.counters.entry(name.clone()).or_default();
            *slot = slot.saturating_add(*value);
        }
        for (name, value) in &other.stacks {
            let slot = self.stacks.entry(name.clone()).or_default();
            *slot = slot.saturating_add(*value);
        }
    }
}

fn collect<'a>(entries: impl Iterator<Item = (&'a str, u64)>) -> BTreeMap<String, u64> {
    entries
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Keeps reports as JSON files on this machine.
#[cfg(feature = "json")]
#[derive(Debug, Clone)]
pub struct LocalReporter {
    dir: PathBuf,
}

#[cfg(feature = "json")]
impl LocalReporter {
    /// Writes reports into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalReporter { dir: dir.into() }
    }

    /// Writes reports into the `local` subdirectory of the session's directory.
    pub fn for_session(session: &crate::session::Session) -> Self {
        Self::new(session.config().dir.join(LOCAL_DIR))
    }

    /// Directory receiving the reports.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(feature = "json")]
impl Reporter for LocalReporter {
    fn report(&self, path: &Path, file: &CounterFile) -> Result<()> {
        let failed = |reason: String| Error::Report {
            path: path.to_path_buf(),
            reason,
        };

        let mut report = Report::from_file(path, file)?;
        fs::create_dir_all(&self.dir).map_err(|err| Error::io(&self.dir, err))?;
        let target = self.dir.join(report.file_name());

        // Two files of the same program can end on the same day.
        match fs::read(&target) {
            Ok(existing) => {
                let existing: Report = serde_json::from_slice(&existing)
                    .map_err(|err| failed(format!("{}: {err}", target.display())))?;
                if existing.contains(&report) {
                    // Written by a run that stopped before removing the file.
                    debug!(target = %target.display(), "counter file already reported");
                    return fs::remove_file(path).map_err(|err| Error::io(path, err));
                }
                report.merge(&existing);
                debug!(target = %target.display(), "merging into existing report");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(&target, err)),
        }

        let json = serde_json::to_vec_pretty(&report).map_err(|err| failed(err.to_string()))?;
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|err| Error::io(&tmp, err))?;
        fs::rename(&tmp, &target).map_err(|err| Error::io(&target, err))?;
        fs::remove_file(path).map_err(|err| Error::io(path, err))
    }
}
