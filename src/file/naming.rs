//! Program identity and the names of the files a session keeps.
//!
//! All files of a program live flat in the counter directory:
//!
//! ```text
//! <dir>/
//!   mode                                             on | off | local
//!   demo@1.2.0-linux-x86_64.lock                     cross-process lock
//!   demo@1.2.0-linux-x86_64.schedule                 active file + expiry
//!   demo@1.2.0-linux-x86_64-2026-10-16.v1.count      one per period
//!   local/                                           reports kept on disk
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::file::format::{
    FILE_VERSION, META_ARCH, META_OS, META_PROGRAM, META_TIME_BEGIN, META_TIME_END, META_VERSION,
};

/// Suffix of every counter file.
pub const COUNT_FILE_SUFFIX: &str = ".count";

/// Suffix of the schedule file.
pub const SCHEDULE_FILE_SUFFIX: &str = ".schedule";

/// Suffix of the lock file.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

/// Who is counting: the program, its version and the platform it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramIdentity {
    /// Program name.
    pub program: String,
    /// Program version.
    pub version: String,
    /// Operating system, as in [`std::env::consts::OS`].
    pub os: String,
    /// CPU architecture, as in [`std::env::consts::ARCH`].
    pub arch: String,
}

impl ProgramIdentity {
    /// Identity of `program` at `version` on the current platform.
    pub fn new(program: impl Into<String>, version: impl Into<String>) -> Self {
        ProgramIdentity {
            program: program.into(),
            version: version.into(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Rejects identities that cannot be embedded in a file name or header.
    pub fn validate(&self) -> Result<()> {
        validate_part("program", &self.program, true)?;
        validate_part("version", &self.version, true)?;
        validate_part("os", &self.os, false)?;
        validate_part("arch", &self.arch, false)
    }

    /// The common prefix of every file name: `<program>@<version>-<os>-<arch>`.
    pub fn stem(&self) -> String {
        format!("{}@{}-{}-{}", self.program, self.version, self.os, self.arch)
    }

    /// Name of the counter file started at `begin`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::{Duration, UNIX_EPOCH};
    /// use conteggi::file::ProgramIdentity;
    ///
    /// let mut id = ProgramIdentity::new("demo", "1.2.0");
    /// id.os = "linux".to_string();
    /// id.arch = "x86_64".to_string();
    ///
    /// let begin = UNIX_EPOCH + Duration::from_secs(1_760_572_800);
    /// assert_eq!(id.count_file_name(begin), "demo@1.2.0-linux-x86_64-2025-10-16.v1.count");
    /// ```
    pub fn count_file_name(&self, begin: SystemTime) -> String {
        format!(
            "{}-{}.{FILE_VERSION}{COUNT_FILE_SUFFIX}",
            self.stem(),
            date_of(begin)
        )
    }

    /// Name of the schedule file.
    pub fn schedule_file_name(&self) -> String {
        format!("{}{SCHEDULE_FILE_SUFFIX}", self.stem())
    }

    /// Name of the lock file.
    pub fn lock_file_name(&self) -> String {
        format!("{}{LOCK_FILE_SUFFIX}", self.stem())
    }

    /// Header metadata of a file covering `begin..end`.
    pub fn meta(&self, begin: SystemTime, end: SystemTime) -> BTreeMap<String, String> {
        BTreeMap::from([
            (META_PROGRAM.to_string(), self.program.clone()),
            (META_VERSION.to_string(), self.version.clone()),
            (META_OS.to_string(), self.os.clone()),
            (META_ARCH.to_string(), self.arch.clone()),
            (META_TIME_BEGIN.to_string(), format_time(begin)),
            (META_TIME_END.to_string(), format_time(end)),
        ])
    }

    /// Reads an identity back from header metadata.
    pub fn from_meta(meta: &BTreeMap<String, String>) -> Option<Self> {
        Some(ProgramIdentity {
            program: meta.get(META_PROGRAM)?.clone(),
            version: meta.get(META_VERSION)?.clone(),
            os: meta.get(META_OS)?.clone(),
            arch: meta.get(META_ARCH)?.clone(),
        })
    }
}

fn validate_part(what: &str, value: &str, allow_dash: bool) -> Result<()> {
    let bad = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace()
                || c.is_control()
                || matches!(c, '/' | '\\' | '@' | ':')
                || (!allow_dash && c == '-')
        });
    if bad {
        return Err(Error::Config(format!("unusable {what} name {value:?}")));
    }
    Ok(())
}

/// Truncates a time to whole seconds, the precision of file metadata.
pub(crate) fn whole_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => time,
    }
}

/// Formats a time as RFC 3339 with second precision, in UTC.
pub fn format_time(time: SystemTime) -> String {
    humantime::format_rfc3339_seconds(time).to_string()
}

/// Parses an RFC 3339 time.
pub fn parse_time(text: &str) -> Option<SystemTime> {
    humantime::parse_rfc3339(text.trim()).ok()
}

/// The UTC calendar date of `time`, as `YYYY-MM-DD`.
pub fn date_of(time: SystemTime) -> String {
    let mut text = format_time(time);
    text.truncate(10);
    text
}
