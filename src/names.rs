//! Counter names and the composite names of stack counters.
//!
//! A stack counter stores one ordinary counter per distinct call stack. Its
//! name is the declared base name followed by one `function:relative-line`
//! location per captured frame, most recent caller first, joined by
//! [`SEPARATOR`]:
//!
//! ```text
//! requests\nserver::handle:12\nserver::accept:4
//! ```
//!
//! The relative line is the call-site line minus the line where the enclosing
//! function starts. It survives edits elsewhere in the file, unlike an absolute
//! line or a program counter.
//!
//! Names are bounded by [`MAX_NAME_LEN`]. Nothing is ever truncated: an
//! overlong name is rejected with [`NameTooLong`] and the caller drops the
//! increment.
//!
//! # Examples
//!
//! ```rust
//! use conteggi::names;
//!
//! let name = names::encode("b", &["f:3", "g:10"]).unwrap();
//! assert_eq!(name, "b\nf:3\ng:10");
//!
//! let (base, locations) = names::decode(&name);
//! assert_eq!(base, "b");
//! assert_eq!(locations.collect::<Vec<_>>(), ["f:3", "g:10"]);
//! ```

use thiserror::Error;

use crate::error::StackWalkError;

/// Maximum length in bytes of any counter name, composite names included.
pub const MAX_NAME_LEN: usize = 256;

/// Separates the base name from the locations of a stack counter name.
///
/// Identifiers and locations never contain a line break.
pub const SEPARATOR: char = '\n';

/// Location used for a frame without symbol information.
pub const UNKNOWN_LOCATION: &str = "?";

/// A counter name longer than [`MAX_NAME_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("counter name is {len} bytes, the limit is {max}")]
pub struct NameTooLong {
    /// Encoded length of the rejected name.
    pub len: usize,
    /// The limit that was exceeded.
    pub max: usize,
}

/// Checks a name against [`MAX_NAME_LEN`].
#[inline]
pub fn check(name: &str) -> Result<(), NameTooLong> {
    if name.len() > MAX_NAME_LEN {
        Err(NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        })
    } else {
        Ok(())
    }
}

/// Builds the composite name of a stack counter.
///
/// With no locations the result is `base` itself, which is how a zero-depth
/// stack counter degenerates into a single counter. The length is computed
/// before anything is allocated, so a rejected name costs no allocation.
pub fn encode<S: AsRef<str>>(base: &str, locations: &[S]) -> Result<String, NameTooLong> {
    let len = locations
        .iter()
        .fold(base.len(), |acc, loc| acc + SEPARATOR.len_utf8() + loc.as_ref().len());

    if len > MAX_NAME_LEN {
        return Err(NameTooLong {
            len,
            max: MAX_NAME_LEN,
        });
    }

    let mut name = String::with_capacity(len);
    name.push_str(base);
    for loc in locations {
        name.push(SEPARATOR);
        name.push_str(loc.as_ref());
    }
    Ok(name)
}

/// Splits a counter name into its base name and its locations.
///
/// Plain counter names yield an empty location iterator.
pub fn decode(name: &str) -> (&str, impl Iterator<Item = &str>) {
    let mut parts = name.split(SEPARATOR);
    let base = parts.next().unwrap_or_default();
    (base, parts)
}

/// Returns `true` if `name` was produced by a stack counter with at least one frame.
#[inline]
pub fn is_stack_name(name: &str) -> bool {
    name.contains(SEPARATOR)
}

/// Computes the build-stable line of a call site: `call_line - entry_line`.
#[inline]
pub fn relative_line(call_line: u32, entry_line: u32) -> i64 {
    i64::from(call_line) - i64::from(entry_line)
}

/// Formats one frame as `function:relative-line`.
///
/// A negative relative line means the stack walk produced inconsistent data.
/// Callers log it and abandon the increment.
pub fn location(function: &str, relative_line: i64) -> Result<String, StackWalkError> {
    if relative_line < 0 {
        return Err(StackWalkError::NegativeLine {
            function: function.to_string(),
            relative: relative_line,
        });
    }
    Ok(format!("{function}:{relative_line}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_joins_with_separator() {
        let name = encode("b", &["f:3", "g:10"]).unwrap();
        assert_eq!(name, "b\nf:3\ng:10");
    }

    #[test]
    fn test_encode_order_matters() {
        let a = encode("b", &["f:3", "g:10"]).unwrap();
        let b = encode("b", &["g:10", "f:3"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_encode_without_locations_is_base() {
        let locations: [&str; 0] = [];
        assert_eq!(encode("base", &locations).unwrap(), "base");
    }

    #[test]
    fn test_encode_rejects_overlong_names() {
        let loc = "x".repeat(99);
        let err = encode("b", &[&loc, &loc, &loc]).unwrap_err();
        assert_eq!(err.len, 1 + 3 * 100);
        assert_eq!(err.max, MAX_NAME_LEN);
    }

    #[test]
    fn test_encode_accepts_exact_limit() {
        let loc = "x".repeat(MAX_NAME_LEN - 2);
        let name = encode("b", &[loc]).unwrap();
        assert_eq!(name.len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_decode_plain_name() {
        let (base, mut locations) = decode("requests");
        assert_eq!(base, "requests");
        assert!(locations.next().is_none());
        assert!(!is_stack_name("requests"));
    }

    #[test]
    fn test_decode_stack_name() {
        let (base, locations) = decode("b\nf:3\ng:10");
        assert_eq!(base, "b");
        assert_eq!(locations.collect::<Vec<_>>(), vec!["f:3", "g:10"]);
        assert!(is_stack_name("b\nf:3"));
    }

    #[test]
    fn test_location() {
        assert_eq!(location("server::handle", 12).unwrap(), "server::handle:12");
        assert_eq!(location("main", 0).unwrap(), "main:0");
    }

    #[test]
    fn test_location_negative_line() {
        let err = location("f", relative_line(3, 10)).unwrap_err();
        assert_eq!(
            err,
            StackWalkError::NegativeLine {
                function: "f".to_string(),
                relative: -7
            }
        );
    }

    #[test]
    fn test_check() {
        assert!(check(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert_eq!(
            check(&"a".repeat(300)),
            Err(NameTooLong { len: 300, max: MAX_NAME_LEN })
        );
    }
}
