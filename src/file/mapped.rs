//! The active counter file, shared by every process of a program.
//!
//! The file is mapped `MAP_SHARED` and all mutable state in it is accessed
//! through atomics, so processes cooperate without a lock on the hot path:
//!
//! - **Increment**: `fetch_add` on the record value.
//! - **Allocate**: compare-and-swap on the allocation limit reserves the
//!   bytes of a new record.
//! - **Publish**: the record is filled in, then linked with a
//!   compare-and-swap on its bucket head. A failed swap rescans the chain,
//!   so two processes creating the same name converge on one record.
//! - **Grow**: a process that reserves past the end of the file extends it
//!   under an exclusive file lock. Every process remaps lazily when it first
//!   needs an offset beyond its current mapping.
//!
//! Old mappings stay alive as long as a [`Slot`] refers to them. They alias
//! the same file pages as the new mapping, so updates through either are
//! equivalent.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use fs2::FileExt;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::file::format::{
    self, bucket_of, bucket_offset, first_record, record_len, round_up, MIN_FILE_LEN,
    NAME_LEN_FIELD, NEXT_FIELD, RECORD_HEADER_LEN,
};
use crate::names::{self, MAX_NAME_LEN};

/// One mapping of the whole file, as long as the file was when mapped.
pub(crate) struct Mapping {
    raw: MmapRaw,
}

impl Mapping {
    fn new(file: &File) -> io::Result<Self> {
        Ok(Mapping {
            raw: MmapOptions::new().map_raw(file)?,
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.raw.len()
    }

    /// Pointer to `size` bytes at `offset`, if in bounds and aligned to `align`.
    #[inline]
    fn ptr(&self, offset: usize, size: usize, align: usize) -> Option<*mut u8> {
        if offset % align != 0 || offset.checked_add(size)? > self.len() {
            return None;
        }
        // SAFETY: offset + size is within the mapping.
        Some(unsafe { self.raw.as_mut_ptr().add(offset) })
    }

    #[inline]
    fn u32_at(&self, offset: usize) -> Option<&AtomicU32> {
        let ptr = self.ptr(offset, 4, 4)?;
        // SAFETY: the mapping is page aligned, so an aligned offset gives an
        // aligned pointer, valid for as long as `self`. Integer fields of the
        // file are only ever accessed atomically.
        Some(unsafe { AtomicU32::from_ptr(ptr.cast()) })
    }

    #[inline]
    fn u64_at(&self, offset: usize) -> Option<&AtomicU64> {
        let ptr = self.ptr(offset, 8, 8)?;
        // SAFETY: as in `u32_at`.
        Some(unsafe { AtomicU64::from_ptr(ptr.cast()) })
    }

    #[inline]
    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let ptr = self.ptr(offset, len, 1)?;
        // SAFETY: in bounds; name bytes are immutable once their record is
        // reachable from a bucket.
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Copies `src` into the file at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own `offset..offset + src.len()`: reserved by this
    /// process and not yet reachable from any bucket.
    unsafe fn write_bytes(&self, offset: usize, src: &[u8]) -> Option<()> {
        let ptr = self.ptr(offset, src.len(), 1)?;
        std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
        Some(())
    }
}

/// A counter record in the shared file.
///
/// Cloning is cheap. A slot stays valid for as long as it exists, even after
/// the file is remapped or replaced by rotation.
#[derive(Clone)]
pub(crate) struct Slot {
    mapping: Arc<Mapping>,
    offset: usize,
}

impl Slot {
    #[inline]
    pub(crate) fn add(&self, delta: u64) {
        if let Some(value) = self.mapping.u64_at(self.offset) {
            value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> u64 {
        self.mapping
            .u64_at(self.offset)
            .map_or(0, |value| value.load(Ordering::Relaxed))
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("offset", &self.offset)
            .field("value", &self.load())
            .finish()
    }
}

/// A counter file mapped for concurrent update.
pub(crate) struct MappedFile {
    path: PathBuf,
    file: File,
    hdr_len: usize,
    first_record: usize,
    mapping: ArcSwap<Mapping>,
    remap: Mutex<()>,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("mapped_len", &self.mapping.load().len())
            .finish()
    }
}

impl MappedFile {
    /// Opens `path`, creating it with `meta` if it does not exist.
    ///
    /// Creation is not atomic with respect to other processes: the caller
    /// holds the directory lock.
    pub(crate) fn open_or_create(path: &Path, meta: &BTreeMap<String, String>) -> Result<Self> {
        let created = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path);

        let file = match created {
            Ok(mut file) => {
                let bytes = format::encode(meta, &BTreeMap::new())?;
                file.write_all(&bytes)
                    .and_then(|()| file.sync_data())
                    .map_err(|err| Error::io(path, err))?;
                debug!(path = %path.display(), "created counter file");
                file
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|err| Error::io(path, err))?,
            Err(err) => return Err(Error::io(path, err)),
        };

        Self::map(path, file)
    }

    fn map(path: &Path, file: File) -> Result<Self> {
        let len = file.metadata().map_err(|err| Error::io(path, err))?.len();
        if len < MIN_FILE_LEN as u64 {
            return Err(Error::Corrupt {
                path: path.to_path_buf(),
                reason: "file shorter than the minimum length",
            });
        }

        let mapping = Mapping::new(&file).map_err(|err| Error::io(path, err))?;
        let parse_err = |source| Error::Parse {
            path: path.to_path_buf(),
            source,
        };
        let head = mapping.bytes(0, MIN_FILE_LEN).unwrap_or_default();
        format::check_prefix(head).map_err(parse_err)?;
        let hdr_len = format::header_len(head).map_err(parse_err)?;

        Ok(MappedFile {
            path: path.to_path_buf(),
            file,
            hdr_len,
            first_record: first_record(hdr_len),
            mapping: ArcSwap::from_pointee(mapping),
            remap: Mutex::new(()),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: &'static str) -> Error {
        Error::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }

    /// Returns the record of `name`, creating it if needed.
    pub(crate) fn slot(&self, name: &str) -> Result<Slot> {
        names::check(name)?;
        let head_at = bucket_offset(self.hdr_len, bucket_of(name.as_bytes()));
        let mut reserved = None;

        loop {
            let mapping = self.mapping.load_full();
            let head = mapping
                .u32_at(head_at)
                .ok_or_else(|| self.corrupt("bucket out of range"))?
                .load(Ordering::Acquire);

            if let Some(found) = self.find(head, name)? {
                if let Some(offset) = reserved {
                    debug!(path = %self.path.display(), offset, name, "record created concurrently, reservation abandoned");
                }
                return Ok(found);
            }

            let offset = match reserved {
                Some(offset) => offset,
                None => *reserved.insert(self.allocate(name)?),
            };

            let mapping = self.mapping_covering(offset + record_len(name.len()))?;
            mapping
                .u32_at(offset + NEXT_FIELD)
                .ok_or_else(|| self.corrupt("record out of range"))?
                .store(head, Ordering::Relaxed);

            let published = mapping
                .u32_at(head_at)
                .ok_or_else(|| self.corrupt("bucket out of range"))?
                .compare_exchange(head, offset as u32, Ordering::AcqRel, Ordering::Acquire);

            if published.is_ok() {
                trace!(path = %self.path.display(), offset, name, "published record");
                return Ok(Slot { mapping, offset });
            }
        }
    }

    /// Walks a bucket chain looking for `name`.
    fn find(&self, head: u32, name: &str) -> Result<Option<Slot>> {
        let mut offset = head as usize;
        let mut steps = 0usize;

        while offset != 0 {
            if offset < self.first_record || offset % 8 != 0 {
                return Err(self.corrupt("record offset out of range"));
            }
            let mapping = self.mapping_covering(offset + RECORD_HEADER_LEN)?;
            let name_len = mapping
                .u32_at(offset + NAME_LEN_FIELD)
                .ok_or_else(|| self.corrupt("record out of range"))?
                .load(Ordering::Relaxed) as usize;
            if name_len > MAX_NAME_LEN {
                return Err(self.corrupt("counter name too long"));
            }

            let mapping = self.mapping_covering(offset + RECORD_HEADER_LEN + name_len)?;
            let stored = mapping
                .bytes(offset + RECORD_HEADER_LEN, name_len)
                .ok_or_else(|| self.corrupt("record out of range"))?;
            if stored == name.as_bytes() {
                return Ok(Some(Slot { mapping, offset }));
            }

            steps += 1;
            if steps > mapping.len() / RECORD_HEADER_LEN {
                return Err(self.corrupt("cyclic record chain"));
            }
            offset = mapping
                .u32_at(offset + NEXT_FIELD)
                .ok_or_else(|| self.corrupt("record out of range"))?
                .load(Ordering::Acquire) as usize;
        }
        Ok(None)
    }

    /// Reserves and fills in an unlinked record for `name`.
    fn allocate(&self, name: &str) -> Result<usize> {
        let size = record_len(name.len());
        let mapping = self.mapping.load_full();
        let limit = mapping
            .u32_at(self.hdr_len)
            .ok_or_else(|| self.corrupt("allocation limit out of range"))?;

        let mut current = limit.load(Ordering::Acquire);
        let (start, end) = loop {
            let start = current as usize;
            if start < self.first_record || start % 8 != 0 {
                return Err(self.corrupt("allocation limit out of range"));
            }
            let end = start
                .checked_add(size)
                .filter(|end| u32::try_from(*end).is_ok())
                .ok_or_else(|| Error::Full(self.path.clone()))?;

            match limit.compare_exchange_weak(
                current,
                end as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (start, end),
                Err(actual) => current = actual,
            }
        };

        let mapping = self.grow_to(end)?;
        let filled = mapping
            .u64_at(start)
            .zip(mapping.u32_at(start + NAME_LEN_FIELD))
            .map(|(value, name_len)| {
                value.store(0, Ordering::Relaxed);
                name_len.store(name.len() as u32, Ordering::Relaxed);
            })
            // SAFETY: start..end was reserved by the swap above and is not
            // linked yet, so no other process reads or writes it.
            .and_then(|()| unsafe { mapping.write_bytes(start + RECORD_HEADER_LEN, name.as_bytes()) });
        filled.ok_or_else(|| self.corrupt("record out of range"))?;

        Ok(start)
    }

    /// Returns a mapping at least `end` bytes long, remapping if the file has
    /// grown since it was last mapped.
    fn mapping_covering(&self, end: usize) -> Result<Arc<Mapping>> {
        let current = self.mapping.load_full();
        if current.len() >= end {
            return Ok(current);
        }

        let _remap = self.remap.lock();
        let current = self.mapping.load_full();
        if current.len() >= end {
            return Ok(current);
        }
        if self.file_len()? < end {
            return Err(self.corrupt("record beyond the end of the file"));
        }
        self.remap()
    }

    /// Extends the file to hold `end` bytes, then remaps.
    fn grow_to(&self, end: usize) -> Result<Arc<Mapping>> {
        let current = self.mapping.load_full();
        if current.len() >= end {
            return Ok(current);
        }

        let _remap = self.remap.lock();
        let current = self.mapping.load_full();
        if current.len() >= end {
            return Ok(current);
        }

        self.file
            .lock_exclusive()
            .map_err(|err| Error::io(&self.path, err))?;
        let grown = self.file_len().and_then(|len| {
            if len >= end {
                return Ok(());
            }
            let new_len = round_up(end, MIN_FILE_LEN)
                .max(len.saturating_mul(2))
                .min(u32::MAX as usize);
            debug!(path = %self.path.display(), from = len, to = new_len, "growing counter file");
            self.file
                .set_len(new_len as u64)
                .map_err(|err| Error::io(&self.path, err))
        });
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to unlock counter file");
        }
        grown?;

        self.remap()
    }

    fn file_len(&self) -> Result<usize> {
        let len = self
            .file
            .metadata()
            .map_err(|err| Error::io(&self.path, err))?
            .len();
        Ok(usize::try_from(len).unwrap_or(usize::MAX))
    }

    /// Maps the file at its current length. Called with `remap` held.
    fn remap(&self) -> Result<Arc<Mapping>> {
        let mapping = Arc::new(Mapping::new(&self.file).map_err(|err| Error::io(&self.path, err))?);
        trace!(path = %self.path.display(), len = mapping.len(), "remapped counter file");
        self.mapping.store(Arc::clone(&mapping));
        Ok(mapping)
    }
}
