//! Error types for the counter store and its tooling.
//!
//! Counter increments never return these errors: every failure on the
//! recording path is downgraded to an [`Outcome`](crate::counters::Outcome)
//! and a log line. The types below surface where a caller can act on them:
//! opening a [`Session`](crate::session::Session), decoding a counter file with
//! [`parse`](crate::file::parse), or driving the upload worker.
//!
//! # Example
//!
//! ```rust
//! use conteggi::error::ParseError;
//! use conteggi::file::parse;
//!
//! match parse(b"not a counter file") {
//!     Err(ParseError::Decode(reason)) => println!("corrupt: {reason}"),
//!     Err(ParseError::VersionMismatch { found }) => println!("skip version {found}"),
//!     Ok(file) => println!("{} counters", file.counts.len()),
//! }
//! ```

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::names::NameTooLong;

/// Errors returned by [`parse`](crate::file::parse).
///
/// The two variants are kept apart so tooling can skip files written by a
/// newer format while still failing loudly on corrupt data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The bytes are not a well-formed counter file.
    #[error("malformed counter file: {0}")]
    Decode(&'static str),

    /// The header is recognized but carries an unsupported format version.
    #[error("unsupported counter file version {found:?}")]
    VersionMismatch {
        /// The version tag found in the header.
        found: String,
    },
}

/// A call stack that cannot be turned into a stable counter name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackWalkError {
    /// The call-site line lies before the entry line of its function.
    #[error("negative relative line {relative} in {function}")]
    NegativeLine {
        /// The function the frame resolved to.
        function: String,
        /// `call line - entry line`.
        relative: i64,
    },
}

/// Unified error type for session, file and upload operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while touching the counter directory.
    #[error("{}: {source}", path.display())]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A counter file could not be decoded.
    #[error("{}: {source}", path.display())]
    Parse {
        /// The file that failed to decode.
        path: PathBuf,
        /// The decoding failure.
        #[source]
        source: ParseError,
    },

    /// The shared mapping of the active file is inconsistent.
    #[error("corrupt counter file {}: {reason}", path.display())]
    Corrupt {
        /// The mapped file.
        path: PathBuf,
        /// What was found to be wrong.
        reason: &'static str,
    },

    /// The active file reached the largest representable size.
    #[error("counter file {} is full", .0.display())]
    Full(PathBuf),

    /// A counter name exceeds the maximum length.
    #[error(transparent)]
    NameTooLong(#[from] NameTooLong),

    /// A metadata key or value cannot be stored in a counter file header.
    #[error("invalid metadata entry {key:?}: {reason}")]
    InvalidMeta {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The program identity or configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The detached upload worker could not be launched.
    #[error("failed to spawn upload worker: {0}")]
    Spawn(#[source] io::Error),

    /// The report collaborator rejected a counter file.
    #[error("report failed for {}: {reason}", path.display())]
    Report {
        /// The counter file being reported.
        path: PathBuf,
        /// Collaborator-provided description.
        reason: String,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for session, file and upload operations.
pub type Result<T> = std::result::Result<T, Error>;
