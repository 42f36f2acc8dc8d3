//! # File-Backed Storage
//!
//! Maps regions of an on-disk file through the platform segment mapper. Each
//! `map()` call creates an independent mapping of just the requested range
//! (plus the alignment prefix), so large files never have to be mapped whole.
//!
//! ## Sizing
//!
//! The extent is the file length. `size()` re-stats the file so growth made
//! by other handles or processes is observed. `grow()` extends the file with
//! zeros and fsyncs; it is the only backend where growth costs real I/O.
//! Stream writes never extend the file: like the mappings, the extent is
//! fixed until the caller grows it.
//!
//! ## Lifetime
//!
//! Mappings hold an `Arc<File>`, so the descriptor stays valid while any
//! region is mapped. `close()` force-unmaps every tracked region and then
//! drops the storage's own handle.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use tracing::trace;

use super::platform::{self, Segment};
use super::region::{Region, RegionTable};
use super::{resolve_range, resolve_seek, Storage, StorageStream};
use crate::error::StorageError;

const BACKEND: &str = "file storage";

#[derive(Debug)]
struct FileInner {
    path: PathBuf,
    read_only: bool,
    file: RwLock<Option<Arc<File>>>,
    size: AtomicU64,
    regions: RegionTable,
}

#[derive(Debug)]
pub struct FileStorage {
    inner: Arc<FileInner>,
}

impl FileStorage {
    /// Opens `path`, creating it when writable.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        Self::open_with(path.as_ref(), read_only, !read_only)
    }

    /// Opens `path` without creating it.
    pub fn open_existing<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        Self::open_with(path.as_ref(), read_only, false)
    }

    fn open_with(path: &Path, read_only: bool, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create)
            .open(path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        Self::from_file(file, path, read_only)
    }

    pub fn from_file(file: File, path: &Path, read_only: bool) -> Result<Self> {
        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        Ok(Self {
            inner: Arc::new(FileInner {
                path: path.to_path_buf(),
                read_only,
                file: RwLock::new(Some(Arc::new(file))),
                size: AtomicU64::new(size),
                regions: RegionTable::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Storage for FileStorage {
    fn map(&self, offset: u64, length: u64) -> Result<Region> {
        let file = self.inner.file.read();
        let file = file
            .as_ref()
            .ok_or_else(|| StorageError::closed(BACKEND))?;

        let size = self.inner.size.load(Ordering::Acquire);
        let length = resolve_range(BACKEND, offset, length, size)?;
        let length = usize::try_from(length).map_err(|_| {
            StorageError::invalid_argument(format!(
                "{}: region too large ({} bytes)",
                BACKEND, length
            ))
        })?;

        let segment = Segment::map(file, offset, length, self.inner.read_only)
            .wrap_err_with(|| format!("failed to map region of '{}'", self.inner.path.display()))?;

        let region = Region::mapped(offset, segment, self.inner.read_only);
        self.inner.regions.track(&region);
        Ok(region)
    }

    fn size(&self) -> Result<u64> {
        let file = self.inner.file.read();
        let file = file
            .as_ref()
            .ok_or_else(|| StorageError::closed(BACKEND))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.inner.path.display()))?
            .len();
        self.inner.size.store(size, Ordering::Release);
        Ok(size)
    }

    fn grow(&self, new_size: u64) -> Result<()> {
        let file = self.inner.file.write();
        let file = file
            .as_ref()
            .ok_or_else(|| StorageError::closed(BACKEND))?;

        if self.inner.read_only {
            return Err(StorageError::read_only("file storage: cannot grow read-only storage").into());
        }

        let current = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.inner.path.display()))?
            .len();
        self.inner.size.store(current, Ordering::Release);
        if new_size <= current {
            return Ok(());
        }

        file.set_len(new_size).wrap_err_with(|| {
            format!(
                "failed to extend '{}' to {} bytes",
                self.inner.path.display(),
                new_size
            )
        })?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.inner.path.display()))?;

        trace!(path = %self.inner.path.display(), from = current, to = new_size, "grew file");
        self.inner.size.store(new_size, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut file = self.inner.file.write();
        if file.is_none() {
            return Ok(());
        }

        let result = self.inner.regions.release_all();
        *file = None;
        result
    }

    fn reader_writer_seeker(&self) -> Result<Box<dyn StorageStream>> {
        if self.inner.file.read().is_none() {
            return Err(StorageError::closed(BACKEND).into());
        }

        Ok(Box::new(FileView {
            inner: Arc::clone(&self.inner),
            pos: 0,
        }))
    }

    fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    fn is_closed(&self) -> bool {
        self.inner.file.read().is_none()
    }
}

/// Byte-stream cursor over a file storage using positional I/O.
#[derive(Debug)]
pub struct FileView {
    inner: Arc<FileInner>,
    pos: u64,
}

impl FileView {
    fn file(&self) -> io::Result<Arc<File>> {
        self.inner
            .file
            .read()
            .clone()
            .ok_or_else(|| StorageError::closed(BACKEND).into_io())
    }
}

impl Read for FileView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        let n = platform::read_at(&file, buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for FileView {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.read_only {
            return Err(
                StorageError::read_only("file storage: cannot write to read-only storage")
                    .into_io(),
            );
        }

        let file = self.file()?;
        let size = self.inner.size.load(Ordering::Acquire);
        let end = self.pos.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > size) {
            return Err(StorageError::invalid_argument(format!(
                "file storage: write of {} bytes at {} exceeds size {}; grow first",
                buf.len(),
                self.pos,
                size
            ))
            .into_io());
        }

        platform::write_at(&file, buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let file = self.file()?;
        if self.inner.read_only {
            return Ok(());
        }
        file.sync_data()
    }
}

impl Seek for FileView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let file = self.file()?;
        let size = file.metadata()?.len();
        self.pos = resolve_seek(BACKEND, pos, self.pos, size, false)?;
        Ok(self.pos)
    }
}
