//! Layout of a counter file, and the decoder used by tooling.
//!
//! A counter file is a text header followed by an open hash table of
//! fixed-offset records. Every process of a program maps the same file and
//! updates record values in place with atomic instructions. See
//! [`mapped`](super::mapped) for the write side.
//!
//! ```text
//! ┌──────────────────────────────────────────┐ 0
//! │ "# conteggi counter file v1\n" + pad     │
//! ├──────────────────────────────────────────┤ 28
//! │ u32 header length H                      │
//! ├──────────────────────────────────────────┤ 32
//! │ "Key: Value\n" ...  zero padded          │
//! ├──────────────────────────────────────────┤ H
//! │ u32 allocation limit                     │
//! │ u32 bucket heads x 512                   │
//! ├──────────────────────────────────────────┤ round8(H + 4 + 2048)
//! │ record: u64 value | u32 len | u32 next   │
//! │         name bytes, padded to 8          │
//! │ record ...                               │
//! └──────────────────────────────────────────┘ file length (>= 16 KiB)
//! ```
//!
//! Integers are stored in host byte order.

use std::collections::BTreeMap;
use std::time::SystemTime;

use bytemuck::{bytes_of, pod_read_unaligned, AnyBitPattern, NoUninit};
use xxhash_rust::xxh3::xxh3_64;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, ParseError};
use crate::file::naming;
use crate::names::{self, MAX_NAME_LEN};

/// Version tag written in, and required from, every counter file header.
pub const FILE_VERSION: &str = "v1";

/// Header magic, followed by the version tag and a line feed.
pub const MAGIC: &str = "# conteggi counter file ";

pub(crate) const HEADER_LEN_OFFSET: usize = 28;
pub(crate) const META_OFFSET: usize = 32;

/// Largest header (magic and metadata) a file may carry.
pub const MAX_HEADER_LEN: usize = 4096;

/// Number of hash buckets.
pub const NUM_BUCKETS: usize = 512;

/// Smallest counter file, and the unit files grow by.
pub const MIN_FILE_LEN: usize = 16 * 1024;

pub(crate) const RECORD_HEADER_LEN: usize = 16;
pub(crate) const NAME_LEN_FIELD: usize = 8;
pub(crate) const NEXT_FIELD: usize = 12;

/// Metadata key naming the program.
pub const META_PROGRAM: &str = "Program";
/// Metadata key naming the program version.
pub const META_VERSION: &str = "Version";
/// Metadata key naming the operating system.
pub const META_OS: &str = "OS";
/// Metadata key naming the CPU architecture.
pub const META_ARCH: &str = "Arch";
/// Metadata key holding the creation time (RFC 3339).
pub const META_TIME_BEGIN: &str = "TimeBegin";
/// Metadata key holding the expiry time (RFC 3339).
pub const META_TIME_END: &str = "TimeEnd";

const _: () = assert!(MAGIC.len() + FILE_VERSION.len() + 1 <= HEADER_LEN_OFFSET);

#[inline]
pub(crate) const fn round_up(n: usize, unit: usize) -> usize {
    n.div_ceil(unit) * unit
}

#[inline]
pub(crate) const fn bucket_offset(hdr_len: usize, bucket: usize) -> usize {
    hdr_len + 4 + 4 * bucket
}

#[inline]
pub(crate) const fn first_record(hdr_len: usize) -> usize {
    round_up(hdr_len + 4 + 4 * NUM_BUCKETS, 8)
}

#[inline]
pub(crate) const fn record_len(name_len: usize) -> usize {
    round_up(RECORD_HEADER_LEN + name_len, 8)
}

#[inline]
pub(crate) fn bucket_of(name: &[u8]) -> usize {
    (xxh3_64(name) % NUM_BUCKETS as u64) as usize
}

fn read<T: AnyBitPattern>(data: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    data.get(offset..end).map(pod_read_unaligned)
}

fn write<T: NoUninit>(data: &mut [u8], offset: usize, value: T) {
    let bytes = bytes_of(&value);
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// The decoded contents of a counter file.
///
/// # Examples
///
/// ```rust
/// use std::collections::BTreeMap;
/// use conteggi::file::{encode, parse, CounterFile};
///
/// let mut file = CounterFile::default();
/// file.meta.insert("Program".to_string(), "demo".to_string());
/// file.counts.insert("opened".to_string(), 3);
///
/// let bytes = encode(&file.meta, &file.counts).unwrap();
/// assert_eq!(parse(&bytes).unwrap(), file);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CounterFile {
    /// Header metadata, unknown keys included.
    pub meta: BTreeMap<String, String>,
    /// Counter values by full counter name.
    pub counts: BTreeMap<String, u64>,
}

impl CounterFile {
    /// Returns a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// When the file was started, if recorded.
    pub fn time_begin(&self) -> Option<SystemTime> {
        self.meta(META_TIME_BEGIN).and_then(naming::parse_time)
    }

    /// When the file expires, if recorded.
    pub fn time_end(&self) -> Option<SystemTime> {
        self.meta(META_TIME_END).and_then(naming::parse_time)
    }

    /// Plain counters, in name order.
    pub fn counters(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts
            .iter()
            .filter(|(name, _)| !names::is_stack_name(name))
            .map(|(name, value)| (name.as_str(), *value))
    }

    /// Stack counter entries, in name order.
    pub fn stacks(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts
            .iter()
            .filter(|(name, _)| names::is_stack_name(name))
            .map(|(name, value)| (name.as_str(), *value))
    }
}

/// Returns `MAGIC + FILE_VERSION + "\n"`.
pub(crate) fn header_prefix() -> String {
    format!("{MAGIC}{FILE_VERSION}\n")
}

fn validate_meta(key: &str, value: &str) -> Result<(), Error> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.contains([':', '\n', '\0']) {
        Some("key contains ':', a line feed or NUL")
    } else if value.contains(['\n', '\0']) {
        Some("value contains a line feed or NUL")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidMeta {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Builds the header (magic, length and metadata), padded to a multiple of 8.
fn encode_header(meta: &BTreeMap<String, String>) -> Result<Vec<u8>, Error> {
    let mut text = String::new();
    for (key, value) in meta {
        validate_meta(key, value)?;
        text.push_str(key);
        text.push_str(": ");
        text.push_str(value);
        text.push('\n');
    }

    let hdr_len = round_up(META_OFFSET + text.len(), 8);
    if hdr_len > MAX_HEADER_LEN {
        return Err(Error::InvalidMeta {
            key: String::new(),
            reason: "metadata does not fit in the header",
        });
    }

    let mut header = vec![0u8; hdr_len];
    let prefix = header_prefix();
    header[..prefix.len()].copy_from_slice(prefix.as_bytes());
    write(&mut header, HEADER_LEN_OFFSET, hdr_len as u32);
    header[META_OFFSET..META_OFFSET + text.len()].copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Encodes metadata and counts into the bytes of a counter file.
///
/// This is the single-writer form of the layout the shared mapping maintains
/// concurrently: it is used to create new files and by tooling and tests.
/// [`parse`] inverts it for every input it accepts.
pub fn encode(
    meta: &BTreeMap<String, String>,
    counts: &BTreeMap<String, u64>,
) -> Result<Vec<u8>, Error> {
    let header = encode_header(meta)?;
    let hdr_len = header.len();
    let first = first_record(hdr_len);

    let mut limit = first;
    for name in counts.keys() {
        names::check(name)?;
        limit += record_len(name.len());
    }
    let limit32 = u32::try_from(limit).map_err(|_| Error::InvalidMeta {
        key: String::new(),
        reason: "counts do not fit in a counter file",
    })?;

    let mut data = vec![0u8; round_up(limit, MIN_FILE_LEN).max(MIN_FILE_LEN)];
    data[..hdr_len].copy_from_slice(&header);
    write(&mut data, hdr_len, limit32);

    let mut offset = first;
    for (name, value) in counts {
        let head_at = bucket_offset(hdr_len, bucket_of(name.as_bytes()));
        let head: u32 = read(&data, head_at).unwrap_or(0);

        write(&mut data, offset, *value);
        write(&mut data, offset + NAME_LEN_FIELD, name.len() as u32);
        write(&mut data, offset + NEXT_FIELD, head);
        let name_at = offset + RECORD_HEADER_LEN;
        data[name_at..name_at + name.len()].copy_from_slice(name.as_bytes());
        write(&mut data, head_at, offset as u32);

        offset += record_len(name.len());
    }
    Ok(data)
}

/// Checks the magic and the version tag.
pub(crate) fn check_prefix(data: &[u8]) -> Result<(), ParseError> {
    const MISSING: ParseError = ParseError::Decode("missing counter file header");

    let rest = data.strip_prefix(MAGIC.as_bytes()).ok_or(MISSING)?;
    let end = rest
        .iter()
        .take(HEADER_LEN_OFFSET - MAGIC.len())
        .position(|b| *b == b'\n')
        .ok_or(MISSING)?;
    let version = std::str::from_utf8(&rest[..end]).map_err(|_| MISSING)?;
    if version != FILE_VERSION {
        return Err(ParseError::VersionMismatch {
            found: version.to_string(),
        });
    }
    Ok(())
}

/// Reads and bounds-checks the header length.
pub(crate) fn header_len(data: &[u8]) -> Result<usize, ParseError> {
    let hdr_len: u32 =
        read(data, HEADER_LEN_OFFSET).ok_or(ParseError::Decode("file too short"))?;
    let hdr_len = hdr_len as usize;
    if !(META_OFFSET..=MAX_HEADER_LEN).contains(&hdr_len) || hdr_len % 8 != 0 {
        return Err(ParseError::Decode("header length out of range"));
    }
    if data.len() < first_record(hdr_len) {
        return Err(ParseError::Decode("file too short"));
    }
    Ok(hdr_len)
}

fn parse_meta(section: &[u8]) -> Result<BTreeMap<String, String>, ParseError> {
    let end = section.iter().position(|b| *b == 0).unwrap_or(section.len());
    let text = std::str::from_utf8(&section[..end])
        .map_err(|_| ParseError::Decode("metadata is not UTF-8"))?;

    // Only '\n' ends a line: a value may end in '\r'.
    let mut meta = BTreeMap::new();
    for line in text.split('\n').filter(|line| !line.is_empty()) {
        let (key, value) = line
            .split_once(": ")
            .ok_or(ParseError::Decode("malformed metadata line"))?;
        meta.insert(key.to_string(), value.to_string());
    }
    Ok(meta)
}

struct Record<'a> {
    value: u64,
    name: &'a str,
    next: usize,
}

fn read_record(data: &[u8], offset: usize, first: usize, limit: usize) -> Result<Record<'_>, ParseError> {
    const OUT_OF_RANGE: ParseError = ParseError::Decode("record offset out of range");

    if offset < first || offset % 8 != 0 || offset + RECORD_HEADER_LEN > limit {
        return Err(OUT_OF_RANGE);
    }
    let value: u64 = read(data, offset).ok_or(OUT_OF_RANGE)?;
    let name_len: u32 = read(data, offset + NAME_LEN_FIELD).ok_or(OUT_OF_RANGE)?;
    let next: u32 = read(data, offset + NEXT_FIELD).ok_or(OUT_OF_RANGE)?;

    let name_len = name_len as usize;
    if name_len > MAX_NAME_LEN {
        return Err(ParseError::Decode("counter name too long"));
    }
    let name_at = offset + RECORD_HEADER_LEN;
    if name_at + name_len > limit {
        return Err(OUT_OF_RANGE);
    }
    let name = std::str::from_utf8(&data[name_at..name_at + name_len])
        .map_err(|_| ParseError::Decode("counter name is not UTF-8"))?;

    Ok(Record {
        value,
        name,
        next: next as usize,
    })
}

/// Decodes the bytes of a counter file.
///
/// Fails with [`ParseError::VersionMismatch`] for files of another format
/// version and with [`ParseError::Decode`] for anything malformed. A file
/// being updated by a running process can be parsed at any time: records
/// become visible only once complete.
///
/// # Examples
///
/// ```rust
/// use conteggi::error::ParseError;
/// use conteggi::file::parse;
///
/// let err = parse(b"# conteggi counter file v9\n").unwrap_err();
/// assert_eq!(err, ParseError::VersionMismatch { found: "v9".to_string() });
/// ```
pub fn parse(data: &[u8]) -> Result<CounterFile, ParseError> {
    check_prefix(data)?;
    let hdr_len = header_len(data)?;
    let meta = parse_meta(&data[META_OFFSET..hdr_len])?;

    let first = first_record(hdr_len);
    let limit: u32 = read(data, hdr_len).ok_or(ParseError::Decode("file too short"))?;
    if (limit as usize) < first {
        return Err(ParseError::Decode("allocation limit out of range"));
    }
    // A writer reserves space before extending the file. A limit past the
    // end means the file was never grown, and nothing past it is linked.
    let limit = (limit as usize).min(data.len());

    // Each record takes at least RECORD_HEADER_LEN bytes, so a longer walk
    // can only be a cycle.
    let max_records = (limit - first) / RECORD_HEADER_LEN;
    let mut visited = 0usize;
    let mut counts = BTreeMap::new();

    for bucket in 0..NUM_BUCKETS {
        let head: u32 = read(data, bucket_offset(hdr_len, bucket))
            .ok_or(ParseError::Decode("file too short"))?;
        let mut offset = head as usize;

        while offset != 0 {
            visited += 1;
            if visited > max_records {
                return Err(ParseError::Decode("cyclic record chain"));
            }
            let record = read_record(data, offset, first, limit)?;
            if bucket_of(record.name.as_bytes()) != bucket {
                return Err(ParseError::Decode("record in the wrong bucket"));
            }
            if counts.insert(record.name.to_string(), record.value).is_some() {
                return Err(ParseError::Decode("duplicate counter name"));
            }
            offset = record.next;
        }
    }

    Ok(CounterFile { meta, counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn counts(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_prefix_fits() {
        assert_eq!(header_prefix(), "# conteggi counter file v1\n");
        assert!(header_prefix().len() <= HEADER_LEN_OFFSET);
    }

    #[test]
    fn test_empty_file() {
        let bytes = encode(&BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(bytes.len(), MIN_FILE_LEN);
        let file = parse(&bytes).unwrap();
        assert!(file.meta.is_empty());
        assert!(file.counts.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let meta = meta(&[("Program", "demo"), ("TimeEnd", "2026-10-23T00:00:00Z")]);
        let counts = counts(&[("opened", 3), ("stack\nmain:2", 7), ("zero", 0)]);
        let file = parse(&encode(&meta, &counts).unwrap()).unwrap();
        assert_eq!(file.meta, meta);
        assert_eq!(file.counts, counts);
    }

    #[test]
    fn test_unknown_meta_preserved() {
        let meta = meta(&[("FutureKey", "value: with colon")]);
        let file = parse(&encode(&meta, &BTreeMap::new()).unwrap()).unwrap();
        assert_eq!(file.meta("FutureKey"), Some("value: with colon"));
    }

    #[test]
    fn test_large_file_grows() {
        let counts: BTreeMap<String, u64> = (0..2000).map(|i| (format!("counter-{i}"), i)).collect();
        let bytes = encode(&BTreeMap::new(), &counts).unwrap();
        assert!(bytes.len() > MIN_FILE_LEN);
        assert_eq!(bytes.len() % MIN_FILE_LEN, 0);
        assert_eq!(parse(&bytes).unwrap().counts, counts);
    }

    #[test]
    fn test_counters_and_stacks() {
        let file = CounterFile {
            meta: BTreeMap::new(),
            counts: counts(&[("a", 1), ("s\nf:1", 2), ("b", 3)]),
        };
        assert_eq!(file.counters().collect::<Vec<_>>(), vec![("a", 1), ("b", 3)]);
        assert_eq!(file.stacks().collect::<Vec<_>>(), vec![("s\nf:1", 2)]);
    }

    #[test]
    fn test_time_meta() {
        let file = CounterFile {
            meta: meta(&[("TimeEnd", "2026-10-23T00:00:00Z")]),
            counts: BTreeMap::new(),
        };
        assert!(file.time_end().is_some());
        assert!(file.time_begin().is_none());
    }

    #[test]
    fn test_encode_rejects_bad_meta() {
        assert!(matches!(
            encode(&meta(&[("Bad:Key", "v")]), &BTreeMap::new()),
            Err(Error::InvalidMeta { .. })
        ));
        assert!(matches!(
            encode(&meta(&[("Key", "line\nbreak")]), &BTreeMap::new()),
            Err(Error::InvalidMeta { .. })
        ));
        let huge = "x".repeat(MAX_HEADER_LEN);
        assert!(matches!(
            encode(&meta(&[("Key", &huge)]), &BTreeMap::new()),
            Err(Error::InvalidMeta { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_long_names() {
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            encode(&BTreeMap::new(), &counts(&[(&long, 1)])),
            Err(Error::NameTooLong(_))
        ));
    }

    #[test]
    fn test_parse_bad_magic() {
        assert_eq!(
            parse(b"hello world").unwrap_err(),
            ParseError::Decode("missing counter file header")
        );
        assert_eq!(
            parse(b"").unwrap_err(),
            ParseError::Decode("missing counter file header")
        );
    }

    #[test]
    fn test_parse_version_mismatch() {
        let mut bytes = encode(&BTreeMap::new(), &BTreeMap::new()).unwrap();
        let at = MAGIC.len() + 1;
        bytes[at] = b'2';
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::VersionMismatch {
                found: "v2".to_string()
            }
        );
    }

    #[test]
    fn test_parse_truncated() {
        let bytes = encode(&BTreeMap::new(), &counts(&[("a", 1)])).unwrap();
        assert_eq!(
            parse(&bytes[..100]).unwrap_err(),
            ParseError::Decode("file too short")
        );
    }

    #[test]
    fn test_parse_bad_header_len() {
        let mut bytes = encode(&BTreeMap::new(), &BTreeMap::new()).unwrap();
        write(&mut bytes, HEADER_LEN_OFFSET, 12u32);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::Decode("header length out of range")
        );
    }

    #[test]
    fn test_parse_bad_meta_line() {
        let mut bytes = encode(&meta(&[("Key", "value")]), &BTreeMap::new()).unwrap();
        // "Key: value" -> "Key; value"
        bytes[META_OFFSET + 3] = b';';
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::Decode("malformed metadata line")
        );
    }

    #[test]
    fn test_parse_bad_limit() {
        let mut bytes = encode(&BTreeMap::new(), &BTreeMap::new()).unwrap();
        let hdr_len = header_len(&bytes).unwrap();
        write(&mut bytes, hdr_len, 8u32);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::Decode("allocation limit out of range")
        );
    }

    #[test]
    fn test_parse_cycle() {
        let mut bytes = encode(&BTreeMap::new(), &counts(&[("a", 1)])).unwrap();
        let hdr_len = header_len(&bytes).unwrap();
        let first = first_record(hdr_len);
        // Point the only record at itself.
        write(&mut bytes, first + NEXT_FIELD, first as u32);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::Decode("cyclic record chain")
        );
    }

    #[test]
    fn test_parse_misaligned_record() {
        let mut bytes = encode(&BTreeMap::new(), &counts(&[("a", 1)])).unwrap();
        let hdr_len = header_len(&bytes).unwrap();
        let at = bucket_offset(hdr_len, bucket_of(b"a"));
        let head: u32 = read(&bytes, at).unwrap();
        write(&mut bytes, at, head + 1);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::Decode("record offset out of range")
        );
    }

    #[test]
    fn test_parse_wrong_bucket() {
        let mut bytes = encode(&BTreeMap::new(), &counts(&[("a", 1)])).unwrap();
        let hdr_len = header_len(&bytes).unwrap();
        let own = bucket_of(b"a");
        let other = (own + 1) % NUM_BUCKETS;
        let head: u32 = read(&bytes, bucket_offset(hdr_len, own)).unwrap();
        write(&mut bytes, bucket_offset(hdr_len, own), 0u32);
        write(&mut bytes, bucket_offset(hdr_len, other), head);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::Decode("record in the wrong bucket")
        );
    }

    #[test]
    fn test_parse_non_utf8_name() {
        let mut bytes = encode(&BTreeMap::new(), &counts(&[("a", 1)])).unwrap();
        let first = first_record(header_len(&bytes).unwrap());
        bytes[first + RECORD_HEADER_LEN] = 0xff;
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::Decode(_)));
    }

    #[test]
    fn test_meta_value_keeps_carriage_return() {
        let meta = meta(&[("Note", "value\r"), ("Città", "perché\r\r")]);
        let file = parse(&encode(&meta, &BTreeMap::new()).unwrap()).unwrap();
        assert_eq!(file.meta, meta);
    }

    #[test]
    fn test_parse_limit_past_end_of_file() {
        let mut bytes = encode(&BTreeMap::new(), &counts(&[("a", 1), ("b", 2)])).unwrap();
        let hdr_len = header_len(&bytes).unwrap();
        let past_end = (bytes.len() + 64) as u32;
        write(&mut bytes, hdr_len, past_end);

        let file = parse(&bytes).unwrap();
        assert_eq!(file.counts, counts(&[("a", 1), ("b", 2)]));
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_encode(
            meta in proptest::collection::btree_map("[A-Za-z][A-Za-z0-9_]{0,15}", "[ -~\r\t\u{e0}-\u{17f}]{0,40}", 0..8),
            counts in proptest::collection::btree_map("[a-z/._-]{1,24}(\n[a-z:0-9]{1,12}){0,3}", any::<u64>(), 0..64),
        ) {
            let bytes = encode(&meta, &counts).unwrap();
            let file = parse(&bytes).unwrap();
            prop_assert_eq!(file.meta, meta);
            prop_assert_eq!(file.counts, counts);
        }
    }
}
