//! Counter files: their format, naming and rotation.
//!
//! # Submodules
//!
//! - [`format`]: the binary layout, [`encode`] and [`parse`]
//! - [`naming`]: [`ProgramIdentity`] and file names
//! - [`schedule`]: expiry computation and the persisted schedule
//! - `mapped`: the shared, concurrently updated mapping of the active file

pub mod format;
pub(crate) mod mapped;
pub mod naming;
pub mod schedule;

pub use format::{encode, parse, CounterFile};
pub use naming::ProgramIdentity;
pub use schedule::{first_expiry, next_expiry, ScheduleState, ROTATION_PERIOD};

use std::path::Path;

use crate::error::{Error, Result};

/// Reads and decodes the counter file at `path`.
pub fn read_counter_file(path: &Path) -> Result<CounterFile> {
    let data = std::fs::read(path).map_err(|err| Error::io(path, err))?;
    parse(&data).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Returns `true` if `path` names a counter file.
pub fn is_counter_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(naming::COUNT_FILE_SUFFIX))
}
