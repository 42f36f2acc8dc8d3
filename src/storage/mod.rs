//! # Storage Module
//!
//! Byte-addressable, memory-mappable extents behind one contract. A caller
//! obtains a [`Storage`] from a factory, maps one or more [`Region`]s, reads and
//! writes bytes in place (or through a byte-stream view), and closes the
//! storage when done.
//!
//! ## Backends
//!
//! | Backend       | Type              | Map                     | Grow                 |
//! |---------------|-------------------|-------------------------|----------------------|
//! | File          | [`FileStorage`]   | mmap of the range       | extend + fsync       |
//! | Memory        | [`MemoryStorage`] | view of shared buffer   | reallocate           |
//! | Archive entry | `ArchiveStorage`  | mmap or materialized    | unsupported          |
//!
//! [`AnyStorage`] is the tagged union over the three, selected by the factory
//! that built it. Callers never branch on which backend they got.
//!
//! ## Contract
//!
//! ```text
//! map(offset, length) -> Region   // length 0 means "to the end"
//! size()                          // File re-stats; others return cached length
//! grow(new_size)                  // no-op when new_size <= size
//! close()                         // unmaps all regions; idempotent
//! reader_writer_seeker()          // Read + Write + Seek over the same bytes
//! ```
//!
//! Every operation on a closed storage fails with `StorageClosed`. Range
//! violations are reported as `InvalidArgument`, never a panic or a silent
//! truncation.
//!
//! ## Thread Safety
//!
//! All storages are `Send + Sync`. Each guards its mutable state with a
//! `parking_lot::RwLock`: `map`/`size` take the read side, `grow`/`close` the
//! write side. Region byte access is synchronized per region backing, not
//! across regions of the same file mapping, matching raw mmap semantics.
//!
//! ## Platform Support
//!
//! The [`platform`] module selects the POSIX or Win32 segment mapper at
//! compile time; both satisfy the same map/flush/unmap contract used by the
//! file backend and by plain-tar archive entries.

mod driver;
mod file;
mod memory;
pub(crate) mod platform;
mod region;

use std::io::{self, Read, Seek, SeekFrom, Write};

use eyre::Result;

use crate::error::StorageError;

pub use driver::{file_factory, flash_factory, memory_factory, AnyStorage, StorageFactory, StorageKind};
pub use file::{FileStorage, FileView};
pub use memory::{Capacity, MemoryStorage, MemoryView};
pub(crate) use memory::SharedBuffer;
pub use region::{Region, RegionBytes, RegionBytesMut};
pub(crate) use region::RegionTable;

/// Byte-stream view over a storage's bytes.
pub trait StorageStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> StorageStream for T {}

/// An addressable, mappable extent of bytes.
pub trait Storage: Send + Sync {
    /// Maps `[offset, offset + length)`; `length == 0` maps to the end.
    fn map(&self, offset: u64, length: u64) -> Result<Region>;

    fn size(&self) -> Result<u64>;

    /// Extends the extent to `new_size` bytes. No-op if already that large.
    fn grow(&self, new_size: u64) -> Result<()>;

    /// Unmaps every outstanding region and releases the backing resource.
    ///
    /// Cleanup is best-effort: every region is attempted and the first error
    /// is returned. A second call is a no-op.
    fn close(&self) -> Result<()>;

    fn reader_writer_seeker(&self) -> Result<Box<dyn StorageStream>>;

    fn is_read_only(&self) -> bool;

    fn is_closed(&self) -> bool;
}

/// Validates a map request and returns the effective length.
pub(crate) fn resolve_range(backend: &str, offset: u64, length: u64, size: u64) -> Result<u64> {
    if offset > size {
        return Err(StorageError::invalid_argument(format!(
            "{}: invalid offset {} (size: {})",
            backend, offset, size
        ))
        .into());
    }

    let length = if length == 0 { size - offset } else { length };

    match offset.checked_add(length) {
        Some(end) if end <= size => {}
        _ => {
            return Err(StorageError::invalid_argument(format!(
                "{}: region extends beyond end (offset: {}, length: {}, size: {})",
                backend, offset, length, size
            ))
            .into())
        }
    }

    if length == 0 {
        return Err(
            StorageError::invalid_argument(format!("{}: cannot map empty region", backend)).into(),
        );
    }

    Ok(length)
}

/// Applies a seek to `current`. `bounded` forbids positions past `size`.
pub(crate) fn resolve_seek(
    backend: &str,
    pos: SeekFrom,
    current: u64,
    size: u64,
    bounded: bool,
) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
    };

    let target = target.ok_or_else(|| {
        StorageError::invalid_argument(format!("{}: negative or overflowing position", backend))
            .into_io()
    })?;

    if bounded && target > size {
        return Err(StorageError::invalid_argument(format!(
            "{}: position beyond end: {}",
            backend, target
        ))
        .into_io());
    }

    Ok(target)
}
