//! # Regions
//!
//! A [`Region`] is a bounded view of a storage's bytes. It is a capability, not
//! an owner: the parent storage keeps a weak reference to every region it hands
//! out in a [`RegionTable`] and force-releases all of them on close, so a
//! region can never outlive the resource it points into.
//!
//! ## Access Model
//!
//! Bytes are reached through lock guards rather than bare slices:
//!
//! ```text
//! region.bytes()     -> MappedRwLockReadGuard<[u8]>    // shared
//! region.bytes_mut() -> MappedRwLockWriteGuard<[u8]>   // exclusive
//! ```
//!
//! Once a region is unmapped (explicitly or by its parent closing) both calls
//! fail with `StorageClosed` instead of exposing freed memory.
//!
//! ## Backing Views
//!
//! | Backing  | Used by                           | Unmap releases      |
//! |----------|-----------------------------------|---------------------|
//! | Mapped   | File storage, plain-tar entries   | the OS mapping      |
//! | Buffer   | Memory storage, gzip-tar entries  | access only         |
//!
//! Buffer views index the live buffer on every access, so writes through one
//! region are visible through every other region over the same bytes, and a
//! grown buffer never leaves a stale view behind.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::warn;

use super::memory::SharedBuffer;
use super::platform::Segment;
use crate::error::StorageError;

pub type RegionBytes<'a> = MappedRwLockReadGuard<'a, [u8]>;
pub type RegionBytesMut<'a> = MappedRwLockWriteGuard<'a, [u8]>;

enum RegionView {
    Mapped(RwLock<Option<Segment>>),
    Buffer {
        buffer: SharedBuffer,
        range: Range<usize>,
        released: AtomicBool,
    },
}

struct RegionInner {
    offset: u64,
    len: u64,
    read_only: bool,
    view: RegionView,
}

/// A mapped view of `[offset, offset + size)` of a storage.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

impl Region {
    pub(crate) fn mapped(offset: u64, segment: Segment, read_only: bool) -> Self {
        let len = segment.as_slice().len() as u64;
        Self {
            inner: Arc::new(RegionInner {
                offset,
                len,
                read_only,
                view: RegionView::Mapped(RwLock::new(Some(segment))),
            }),
        }
    }

    pub(crate) fn buffered(buffer: SharedBuffer, range: Range<usize>, read_only: bool) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                offset: range.start as u64,
                len: range.len() as u64,
                read_only,
                view: RegionView::Buffer {
                    buffer,
                    range,
                    released: AtomicBool::new(false),
                },
            }),
        }
    }

    /// Offset of the first byte within the parent storage.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn size(&self) -> u64 {
        self.inner.len
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_mapped(&self) -> bool {
        match &self.inner.view {
            RegionView::Mapped(segment) => segment.read().is_some(),
            RegionView::Buffer { released, .. } => !released.load(Ordering::Acquire),
        }
    }

    /// Read guard over the region's bytes. Memory-backed guards hold the
    /// buffer lock, so drop them before calling `grow` or `close` on the
    /// parent storage from the same thread.
    pub fn bytes(&self) -> Result<RegionBytes<'_>> {
        match &self.inner.view {
            RegionView::Mapped(segment) => {
                RwLockReadGuard::try_map(segment.read(), |s| s.as_ref().map(Segment::as_slice))
                    .map_err(|_| unmapped())
            }
            RegionView::Buffer {
                buffer,
                range,
                released,
            } => {
                let guard = buffer.read();
                if released.load(Ordering::Acquire) {
                    return Err(unmapped());
                }
                RwLockReadGuard::try_map(guard, |data| data.get(range.clone()))
                    .map_err(|_| unmapped())
            }
        }
    }

    pub fn bytes_mut(&self) -> Result<RegionBytesMut<'_>> {
        if self.inner.read_only {
            return Err(StorageError::read_only("region is mapped read-only").into());
        }

        match &self.inner.view {
            RegionView::Mapped(segment) => {
                RwLockWriteGuard::try_map(segment.write(), |s| {
                    s.as_mut().and_then(Segment::as_mut_slice)
                })
                .map_err(|_| unmapped())
            }
            RegionView::Buffer {
                buffer,
                range,
                released,
            } => {
                let guard = buffer.write();
                if released.load(Ordering::Acquire) {
                    return Err(unmapped());
                }
                RwLockWriteGuard::try_map(guard, |data| data.get_mut(range.clone()))
                    .map_err(|_| unmapped())
            }
        }
    }

    /// Copies the region's bytes out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.bytes()?.to_vec())
    }

    /// Flushes dirty pages to the backing file. No-op for read-only and
    /// buffer-backed regions.
    pub fn sync(&self) -> Result<()> {
        match &self.inner.view {
            RegionView::Mapped(segment) => match segment.read().as_ref() {
                Some(segment) if !self.inner.read_only => segment.flush(),
                Some(_) => Ok(()),
                None => Err(unmapped()),
            },
            RegionView::Buffer { .. } => Ok(()),
        }
    }

    /// Releases the mapping. Idempotent.
    pub fn unmap(&self) -> Result<()> {
        self.inner.release();
        Ok(())
    }
}

impl RegionInner {
    fn release(&self) {
        match &self.view {
            RegionView::Mapped(segment) => {
                // Dropping the segment unmaps it.
                drop(segment.write().take());
            }
            RegionView::Buffer { released, .. } => released.store(true, Ordering::Release),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("offset", &self.inner.offset)
            .field("len", &self.inner.len)
            .field("read_only", &self.inner.read_only)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

fn unmapped() -> eyre::Report {
    StorageError::new(
        crate::error::ErrorKind::StorageClosed,
        "region has been unmapped",
    )
    .into()
}

/// Regions handed out by one storage, released together on close.
#[derive(Default)]
pub(crate) struct RegionTable {
    regions: Mutex<Vec<Weak<RegionInner>>>,
}

impl RegionTable {
    pub(crate) fn track(&self, region: &Region) {
        let mut regions = self.regions.lock();
        regions.retain(|weak| weak.strong_count() > 0);
        regions.push(Arc::downgrade(&region.inner));
    }

    /// Releases every live region, continuing past failures and returning the
    /// first one.
    pub(crate) fn release_all(&self) -> Result<()> {
        let regions = std::mem::take(&mut *self.regions.lock());
        let mut first_err = None;

        for region in regions.iter().filter_map(Weak::upgrade) {
            let handle = Region { inner: region };
            if let Err(err) = handle.unmap() {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!(error = %err, "additional failure releasing region");
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of tracked regions still alive.
    pub(crate) fn live(&self) -> usize {
        self.regions
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for RegionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionTable")
            .field("live", &self.live())
            .finish()
    }
}
