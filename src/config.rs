//! Session configuration and the user's telemetry mode.
//!
//! The mode is a user decision, stored as a single word in the `mode` file of
//! the counter directory so that every program using the directory honours
//! it:
//!
//! | Mode | Counting | Reports |
//! |------|----------|---------|
//! | `off` | no | no |
//! | `local` | yes | kept on disk |
//! | `on` | yes | kept on disk and eligible for upload |
//!
//! A missing mode file means [`Mode::Local`].

use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};
use crate::file::ProgramIdentity;

/// Name of the mode file inside the counter directory.
pub const MODE_FILE: &str = "mode";

/// Environment variable overriding the counter directory.
pub const DIR_ENV: &str = "CONTEGGI_DIR";

/// Version recorded when the host does not provide one.
pub const DEFAULT_VERSION: &str = "devel";

/// The user's telemetry choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Nothing is counted and no file is touched.
    Off,
    /// Counters are recorded and reports stay on this machine.
    #[default]
    Local,
    /// Counters are recorded and reports may be uploaded.
    On,
}

impl Mode {
    /// The word stored in the mode file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Local => "local",
            Mode::On => "on",
        }
    }

    /// Returns `true` unless the mode is [`Mode::Off`].
    #[inline]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Mode::Off)
    }

    /// Returns `true` if reports may leave the machine.
    #[inline]
    pub fn allows_upload(&self) -> bool {
        matches!(self, Mode::On)
    }

    /// Reads the mode of `dir`.
    ///
    /// A missing file yields the default. An unreadable or unrecognised one is
    /// logged and also yields the default.
    pub fn load(dir: &Path) -> Mode {
        let path = dir.join(MODE_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => text.parse().unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring mode file");
                Mode::default()
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Mode::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read mode file");
                Mode::default()
            }
        }
    }

    /// Writes the mode of `dir`, creating the directory if needed.
    pub fn store(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
        let path = dir.join(MODE_FILE);
        fs::write(&path, format!("{self}\n")).map_err(|err| Error::io(&path, err))
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "off" => Ok(Mode::Off),
            "local" => Ok(Mode::Local),
            "on" => Ok(Mode::On),
            other => Err(Error::Config(format!("unknown mode {other:?}"))),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The default counter directory.
///
/// In order of preference: `$CONTEGGI_DIR`, `$XDG_CONFIG_HOME/conteggi`,
/// `$HOME/.config/conteggi`, `%APPDATA%\conteggi`, and finally a `conteggi`
/// directory under the system temporary directory.
pub fn default_dir() -> PathBuf {
    let var = |name: &str| std::env::var_os(name).filter(|value| !value.is_empty());

    if let Some(dir) = var(DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(config) = var("XDG_CONFIG_HOME") {
        return Path::new(&config).join("conteggi");
    }
    if let Some(home) = var("HOME") {
        return Path::new(&home).join(".config").join("conteggi");
    }
    if let Some(appdata) = var("APPDATA") {
        return Path::new(&appdata).join("conteggi");
    }
    std::env::temp_dir().join("conteggi")
}

/// Everything a [`Session`](crate::session::Session) needs to know.
///
/// # Examples
///
/// ```rust
/// use conteggi::config::{Config, Mode};
///
/// let config = Config::new("demo")
///     .with_version("1.2.0")
///     .with_dir("/tmp/conteggi-doc")
///     .with_mode(Mode::Local);
/// assert_eq!(config.identity().stem().split('-').next(), Some("demo@1.2.0"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Program name recorded in file names and metadata.
    pub program: String,
    /// Program version recorded in file names and metadata.
    pub version: String,
    /// Directory holding the counter files.
    pub dir: PathBuf,
    /// Mode override. `None` reads the mode file of `dir`.
    pub mode: Option<Mode>,
}

impl Config {
    /// Configuration for `program` with the default directory and mode.
    pub fn new(program: impl Into<String>) -> Self {
        Config {
            program: program.into(),
            version: DEFAULT_VERSION.to_string(),
            dir: default_dir(),
            mode: None,
        }
    }

    /// Sets the program version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the counter directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Forces a mode instead of reading the mode file.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// The identity of the configured program on this platform.
    pub fn identity(&self) -> ProgramIdentity {
        ProgramIdentity::new(self.program.clone(), self.version.clone())
    }

    /// The effective mode: the override if set, the mode file otherwise.
    pub fn resolve_mode(&self) -> Mode {
        self.mode.unwrap_or_else(|| Mode::load(&self.dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("on".parse::<Mode>().unwrap(), Mode::On);
        assert_eq!("off\n".parse::<Mode>().unwrap(), Mode::Off);
        assert_eq!(" local ".parse::<Mode>().unwrap(), Mode::Local);
        assert!(matches!("maybe".parse::<Mode>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_mode_flags() {
        assert!(!Mode::Off.is_enabled());
        assert!(Mode::Local.is_enabled());
        assert!(!Mode::Local.allows_upload());
        assert!(Mode::On.allows_upload());
    }

    #[test]
    fn test_mode_load_and_store() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Mode::load(dir.path()), Mode::Local);

        Mode::Off.store(dir.path()).unwrap();
        assert_eq!(Mode::load(dir.path()), Mode::Off);

        fs::write(dir.path().join(MODE_FILE), "sometimes").unwrap();
        assert_eq!(Mode::load(dir.path()), Mode::Local);
    }

    #[test]
    fn test_store_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        Mode::On.store(&nested).unwrap();
        assert_eq!(Mode::load(&nested), Mode::On);
    }

    #[test]
    fn test_resolve_mode() {
        let dir = tempfile::tempdir().unwrap();
        Mode::Off.store(dir.path()).unwrap();

        let config = Config::new("demo").with_dir(dir.path());
        assert_eq!(config.resolve_mode(), Mode::Off);
        assert_eq!(config.with_mode(Mode::On).resolve_mode(), Mode::On);
    }

    #[test]
    fn test_builder() {
        let config = Config::new("demo").with_version("2.0").with_dir("/x");
        assert_eq!(config.version, "2.0");
        assert_eq!(config.dir, PathBuf::from("/x"));
        assert_eq!(config.identity().program, "demo");
    }
}
