//! Rotation schedule of counter files.
//!
//! The first file of a program expires at a random time between one and two
//! weeks after it is created, so that installations started on the same day
//! do not all report on the same day. Every later file expires exactly one
//! [`ROTATION_PERIOD`] (or a whole multiple of it) after its predecessor.
//!
//! The schedule is persisted next to the counter files so that every process
//! of the program agrees on which file is active:
//!
//! ```text
//! File: demo@1.2.0-linux-x86_64-2026-10-16.v1.count
//! TimeEnd: 2026-10-25T06:13:20Z
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result};
use crate::file::naming::{format_time, parse_time, COUNT_FILE_SUFFIX};

/// Length of a counting period.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Expiry of the very first file: strictly between one and two periods after `now`.
///
/// # Examples
///
/// ```rust
/// use std::time::SystemTime;
/// use conteggi::file::{first_expiry, ROTATION_PERIOD};
///
/// let now = SystemTime::now();
/// let expiry = first_expiry(now, &mut rand::rng());
/// assert!(expiry > now + ROTATION_PERIOD);
/// assert!(expiry < now + 2 * ROTATION_PERIOD);
/// ```
pub fn first_expiry<R: Rng + ?Sized>(now: SystemTime, rng: &mut R) -> SystemTime {
    let period = ROTATION_PERIOD.as_secs();
    now + Duration::from_secs(rng.random_range(period + 1..2 * period))
}

/// Expiry of the file that follows one expiring at `previous`.
///
/// This is `previous + ROTATION_PERIOD * k` for the smallest `k >= 1` that
/// lies after `now`, which keeps the weekly phase even when the program did
/// not run for a while.
pub fn next_expiry(previous: SystemTime, now: SystemTime) -> SystemTime {
    let next = previous + ROTATION_PERIOD;
    if next > now {
        return next;
    }
    let period = ROTATION_PERIOD.as_secs();
    let behind = now.duration_since(next).unwrap_or_default().as_secs();
    next + Duration::from_secs((behind / period + 1) * period)
}

/// The persisted schedule: the active file and when it expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    /// File name of the active counter file, relative to the counter directory.
    pub file: String,
    /// When the active file expires.
    pub expiry: SystemTime,
}

impl ScheduleState {
    /// Loads the schedule, or `None` if there is none yet.
    ///
    /// A malformed schedule is logged and treated as absent: the next file
    /// then starts a fresh schedule.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(path, err)),
        };
        let state = Self::parse(&text);
        if state.is_none() {
            warn!(path = %path.display(), "ignoring malformed schedule file");
        }
        Ok(state)
    }

    /// Writes the schedule, replacing the previous one atomically.
    pub fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("schedule.tmp");
        fs::write(&tmp, self.render()).map_err(|err| Error::io(&tmp, err))?;
        fs::rename(&tmp, path).map_err(|err| Error::io(path, err))
    }

    fn render(&self) -> String {
        format!("File: {}\nTimeEnd: {}\n", self.file, format_time(self.expiry))
    }

    fn parse(text: &str) -> Option<Self> {
        let mut file = None;
        let mut expiry = None;
        for line in text.lines() {
            match line.split_once(": ") {
                Some(("File", value)) => file = Some(value.to_string()),
                Some(("TimeEnd", value)) => expiry = parse_time(value),
                _ => {}
            }
        }
        let file = file.filter(|name| {
            name.ends_with(COUNT_FILE_SUFFIX) && !name.contains(['/', '\\']) && name != ".."
        })?;
        Some(ScheduleState {
            file,
            expiry: expiry?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(text: &str) -> SystemTime {
        parse_time(text).unwrap()
    }

    #[test]
    fn test_first_expiry_window() {
        let now = at("2026-10-16T00:00:00Z");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let expiry = first_expiry(now, &mut rng);
            assert!(expiry > now + ROTATION_PERIOD);
            assert!(expiry < now + 2 * ROTATION_PERIOD);
        }
    }

    #[test]
    fn test_next_expiry_is_one_period_later() {
        let previous = at("2026-10-16T06:00:00Z");
        let now = at("2026-10-16T06:00:01Z");
        assert_eq!(next_expiry(previous, now), previous + ROTATION_PERIOD);
    }

    #[test]
    fn test_next_expiry_keeps_phase_after_gap() {
        let previous = at("2026-10-01T06:00:00Z");
        // Three and a half periods later.
        let now = previous + ROTATION_PERIOD * 3 + ROTATION_PERIOD / 2;
        let next = next_expiry(previous, now);
        assert_eq!(next, previous + ROTATION_PERIOD * 4);
        assert!(next > now);
    }

    #[test]
    fn test_next_expiry_on_boundary() {
        let previous = at("2026-10-01T06:00:00Z");
        let now = previous + ROTATION_PERIOD;
        assert_eq!(next_expiry(previous, now), previous + ROTATION_PERIOD * 2);
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.schedule");
        assert_eq!(ScheduleState::load(&path).unwrap(), None);

        let state = ScheduleState {
            file: "demo-2026-10-16.v1.count".to_string(),
            expiry: at("2026-10-25T06:13:20Z"),
        };
        state.store(&path).unwrap();
        assert_eq!(ScheduleState::load(&path).unwrap(), Some(state));
    }

    #[test]
    fn test_malformed_schedule_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.schedule");

        fs::write(&path, "File: x.v1.count\nTimeEnd: soon\n").unwrap();
        assert_eq!(ScheduleState::load(&path).unwrap(), None);

        fs::write(&path, "File: ../x.v1.count\nTimeEnd: 2026-10-25T06:13:20Z\n").unwrap();
        assert_eq!(ScheduleState::load(&path).unwrap(), None);
    }
}
