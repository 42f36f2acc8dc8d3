//! # Memory-Backed Storage
//!
//! A growable byte buffer behind a lock. Serves three roles:
//!
//! - the general in-memory backend (`memory_factory`)
//! - the staging buffer behind writable archive members
//! - fixed-capacity media such as a flash image (`flash_factory`)
//!
//! ## Sharing
//!
//! The buffer is an `Arc<RwLock<Vec<u8>>>` that several storage handles may
//! share. Each handle has its own closed flag and region table: closing a
//! handle invalidates that handle and the regions it mapped, but leaves the
//! bytes to whoever else holds the buffer. The archive factory relies on this
//! to keep staged bytes alive until commit.
//!
//! ## Regions
//!
//! Regions are true zero-copy views: they index the shared buffer on each
//! access, so a write through one region is visible through the storage and
//! through every overlapping region. Growth reallocates the `Vec` but regions
//! keep addressing the same logical range of the new allocation.
//!
//! Byte guards hold the buffer lock. Drop them before calling `grow()` or
//! writing through a stream view on the same thread.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use eyre::Result;
use parking_lot::RwLock;

use super::region::{Region, RegionTable};
use super::{resolve_range, resolve_seek, Storage, StorageStream};
use crate::error::StorageError;

const BACKEND: &str = "memory storage";

pub(crate) type SharedBuffer = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Stream writes past the end extend the buffer.
    Growable,
    /// Stream writes may not extend the buffer; read-only fixed media cannot
    /// grow at all.
    Fixed,
}

#[derive(Debug)]
struct MemoryInner {
    buffer: SharedBuffer,
    read_only: bool,
    capacity: Capacity,
    closed: RwLock<bool>,
    regions: RegionTable,
}

#[derive(Debug)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    /// Zero-filled growable storage of `initial_size` bytes.
    pub fn new(initial_size: usize) -> Self {
        Self::with_data(vec![0; initial_size])
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self::from_shared(Arc::new(RwLock::new(data)), false, Capacity::Growable)
    }

    /// Wraps a pre-populated image whose extent stream writes may not change.
    pub fn fixed(data: Vec<u8>, read_only: bool) -> Self {
        Self::from_shared(Arc::new(RwLock::new(data)), read_only, Capacity::Fixed)
    }

    pub(crate) fn from_shared(buffer: SharedBuffer, read_only: bool, capacity: Capacity) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                buffer,
                read_only,
                capacity,
                closed: RwLock::new(false),
                regions: RegionTable::default(),
            }),
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.inner.capacity
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let closed = self.inner.closed.read();
        if *closed {
            return Err(StorageError::closed(BACKEND).into());
        }
        Ok(self.inner.buffer.read().clone())
    }
}

impl Storage for MemoryStorage {
    fn map(&self, offset: u64, length: u64) -> Result<Region> {
        let closed = self.inner.closed.read();
        if *closed {
            return Err(StorageError::closed(BACKEND).into());
        }

        let size = self.inner.buffer.read().len() as u64;
        let length = resolve_range(BACKEND, offset, length, size)?;
        let range = offset as usize..(offset + length) as usize;

        let region = Region::buffered(Arc::clone(&self.inner.buffer), range, self.inner.read_only);
        self.inner.regions.track(&region);
        Ok(region)
    }

    fn size(&self) -> Result<u64> {
        let closed = self.inner.closed.read();
        if *closed {
            return Err(StorageError::closed(BACKEND).into());
        }
        Ok(self.inner.buffer.read().len() as u64)
    }

    fn grow(&self, new_size: u64) -> Result<()> {
        let closed = self.inner.closed.write();
        if *closed {
            return Err(StorageError::closed(BACKEND).into());
        }

        if self.inner.read_only {
            return Err(match self.inner.capacity {
                Capacity::Fixed => {
                    StorageError::unsupported("memory storage: cannot grow read-only fixed media")
                }
                Capacity::Growable => {
                    StorageError::read_only("memory storage: cannot grow read-only storage")
                }
            }
            .into());
        }

        let new_size = usize::try_from(new_size).map_err(|_| {
            StorageError::invalid_argument(format!("memory storage: invalid size {}", new_size))
        })?;

        let mut data = self.inner.buffer.write();
        extend_zeroed(&mut data, new_size)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut closed = self.inner.closed.write();
        if *closed {
            return Ok(());
        }

        let result = self.inner.regions.release_all();
        *closed = true;
        result
    }

    fn reader_writer_seeker(&self) -> Result<Box<dyn StorageStream>> {
        let closed = self.inner.closed.read();
        if *closed {
            return Err(StorageError::closed(BACKEND).into());
        }

        Ok(Box::new(MemoryView {
            inner: Arc::clone(&self.inner),
            pos: 0,
        }))
    }

    fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }
}

/// Zero-extends `data` to `new_len`. Allocation failure is reported instead
/// of aborting.
fn extend_zeroed(data: &mut Vec<u8>, new_len: usize) -> std::result::Result<(), StorageError> {
    if new_len <= data.len() {
        return Ok(());
    }

    data.try_reserve_exact(new_len - data.len()).map_err(|err| {
        StorageError::invalid_argument(format!(
            "memory storage: cannot allocate {} bytes: {}",
            new_len, err
        ))
    })?;
    data.resize(new_len, 0);
    Ok(())
}

/// Byte-stream cursor over a memory storage.
#[derive(Debug)]
pub struct MemoryView {
    inner: Arc<MemoryInner>,
    pos: u64,
}

impl MemoryView {
    fn ensure_open(&self) -> io::Result<()> {
        if *self.inner.closed.read() {
            return Err(StorageError::closed(BACKEND).into_io());
        }
        Ok(())
    }
}

impl Read for MemoryView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;

        let data = self.inner.buffer.read();
        let size = data.len() as u64;
        if self.pos >= size {
            return Ok(0);
        }

        let start = self.pos as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryView {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.read_only {
            return Err(
                StorageError::read_only("memory storage: cannot write to read-only storage")
                    .into_io(),
            );
        }
        self.ensure_open()?;

        let end = self
            .pos
            .checked_add(buf.len() as u64)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or_else(|| {
                StorageError::invalid_argument("memory storage: write position overflow").into_io()
            })?;

        let mut data = self.inner.buffer.write();
        if end > data.len() {
            if self.inner.capacity == Capacity::Fixed {
                return Err(StorageError::unsupported(
                    "memory storage: cannot extend fixed-capacity storage",
                )
                .into_io());
            }
            extend_zeroed(&mut data, end).map_err(StorageError::into_io)?;
        }

        let start = self.pos as usize;
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_open()?;
        let size = self.inner.buffer.read().len() as u64;
        self.pos = resolve_seek(BACKEND, pos, self.pos, size, false)?;
        Ok(self.pos)
    }
}
