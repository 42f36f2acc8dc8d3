//! # Segment Mapper
//!
//! Platform glue that maps a byte range of an open file into the address
//! space. Callers ask for `[offset, offset + len)` at any byte offset; the OS
//! only maps at allocation-granularity boundaries, so the mapper rounds the
//! offset down, maps the extra `delta` bytes in front, and exposes the view
//! starting at `delta`:
//!
//! ```text
//! aligned_offset        offset                      offset + len
//!      │<──── delta ────>│<──────────── len ─────────────>│
//!      └─────────────────┴────────────────────────────────┘
//!                  mapped: delta + len bytes
//! ```
//!
//! ## Platform Implementations
//!
//! | Platform | Granularity source          | Flush                               |
//! |----------|-----------------------------|-------------------------------------|
//! | POSIX    | `sysconf(_SC_PAGESIZE)`     | `msync(MS_SYNC)`                    |
//! | Windows  | `GetSystemInfo` (cached)    | `FlushViewOfFile` + `FlushFileBuffers` |
//!
//! The actual `mmap`/`MapViewOfFile` and `munmap`/`UnmapViewOfFile` calls go
//! through `memmap2`; unmapping happens when a [`Segment`] is dropped. On
//! Windows `memmap2` also closes the mapping handle at that point.
//!
//! The module also carries positional file I/O (`read_at` / `write_at`),
//! which is spelled differently per platform and lets byte-stream views keep
//! their own cursor instead of sharing the file's.

use std::fs::File;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::trace;

use crate::error::StorageError;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{read_at, sync_directory, write_at, PosixMapper as PlatformMapper};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{read_at, sync_directory, write_at, Win32Mapper as PlatformMapper};

/// The per-OS half of segment mapping.
pub(crate) trait SegmentMapper {
    /// Boundary that mapping offsets must be aligned to.
    fn granularity() -> u64;

    /// Writes dirty pages of `map` back to `file` and waits for completion.
    fn flush(map: &MmapMut, file: &File) -> Result<()>;
}

#[derive(Debug)]
enum SegmentMap {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A live mapping of `len` bytes at a caller-chosen file offset.
#[derive(Debug)]
pub(crate) struct Segment {
    map: SegmentMap,
    file: Arc<File>,
    delta: usize,
    len: usize,
}

impl Segment {
    pub(crate) fn map(file: &Arc<File>, offset: u64, len: usize, read_only: bool) -> Result<Self> {
        if len == 0 {
            return Err(StorageError::invalid_argument("cannot map empty region").into());
        }

        let (aligned, delta) = align_down(offset, PlatformMapper::granularity());
        let mapped_len = len.checked_add(delta).ok_or_else(|| {
            StorageError::invalid_argument(format!("region too large ({} bytes)", len))
        })?;

        let mut options = MmapOptions::new();
        options.offset(aligned).len(mapped_len);

        // SAFETY: mapping a file is unsafe because another process may truncate
        // or rewrite it underneath us. This is sound for our use because:
        // 1. Callers bounds-check [offset, offset + len) against the file size
        //    before mapping, so the mapping never starts past EOF
        // 2. The Segment owns an Arc<File>, keeping the descriptor open for the
        //    whole life of the mapping
        // 3. All access goes through as_slice()/as_mut_slice(), which only hand
        //    out the [delta, delta + len) window of the mapping
        let map = unsafe {
            if read_only {
                options.map(&**file).map(SegmentMap::ReadOnly)
            } else {
                options.map_mut(&**file).map(SegmentMap::ReadWrite)
            }
        }
        .wrap_err_with(|| {
            format!(
                "failed to map {} bytes at offset {} (aligned to {})",
                len, offset, aligned
            )
        })?;

        trace!(offset, aligned, len, read_only, "mapped segment");

        Ok(Self {
            map,
            file: Arc::clone(file),
            delta,
            len,
        })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        let view = match &self.map {
            SegmentMap::ReadOnly(map) => &map[..],
            SegmentMap::ReadWrite(map) => &map[..],
        };
        &view[self.delta..self.delta + self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.map {
            SegmentMap::ReadOnly(_) => None,
            SegmentMap::ReadWrite(map) => Some(&mut map[self.delta..self.delta + self.len]),
        }
    }

    /// Flushes the whole mapped range, alignment prefix included.
    pub(crate) fn flush(&self) -> Result<()> {
        match &self.map {
            SegmentMap::ReadOnly(_) => Ok(()),
            SegmentMap::ReadWrite(map) => PlatformMapper::flush(map, &self.file),
        }
    }
}

/// Returns `(aligned_offset, delta)` with `aligned_offset + delta == offset`.
pub(crate) fn align_down(offset: u64, granularity: u64) -> (u64, usize) {
    let granularity = granularity.max(1);
    let aligned = offset - offset % granularity;
    (aligned, (offset - aligned) as usize)
}
