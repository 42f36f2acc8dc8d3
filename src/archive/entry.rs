//! # Archive-Entry Storage
//!
//! Read-only storage over a single member of a tar archive. The backing
//! depends on the archive's encoding:
//!
//! - plain tar: the member's payload is mapped in place, anchored at its byte
//!   offset inside the archive file, so reads stay zero-copy
//! - gzip tar: the payload was decompressed into one buffer at open time and
//!   regions view that buffer
//!
//! Archive members are immutable through this type. Growth fails with
//! `Unsupported`; changes go through a writable open on the factory, which
//! stages the member in memory until commit.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use tracing::debug;

use super::scan::{detect_gzip, load_gzip_entry, locate_entry};
use crate::error::StorageError;
use crate::storage::platform::{self, Segment};
use crate::storage::{
    resolve_range, resolve_seek, Region, RegionTable, SharedBuffer, Storage, StorageStream,
};

const BACKEND: &str = "archive entry";

#[derive(Debug)]
enum Backing {
    Mapped { file: Arc<File>, base: u64 },
    Materialized(SharedBuffer),
}

#[derive(Debug)]
struct ArchiveInner {
    archive_path: PathBuf,
    entry_name: String,
    size: u64,
    compressed: bool,
    backing: RwLock<Option<Backing>>,
    regions: RegionTable,
}

#[derive(Debug)]
pub struct ArchiveStorage {
    inner: Arc<ArchiveInner>,
}

impl ArchiveStorage {
    /// Resolves the first member matching `candidates` inside the archive.
    pub(crate) fn open(archive_path: &Path, candidates: &[String]) -> Result<Self> {
        let file = File::open(archive_path)
            .wrap_err_with(|| format!("failed to open archive '{}'", archive_path.display()))?;

        if detect_gzip(&file)? {
            let (data, name) = load_gzip_entry(&file, candidates)
                .wrap_err_with(|| format!("in archive '{}'", archive_path.display()))?;
            debug!(
                archive = %archive_path.display(),
                entry = %name,
                size = data.len(),
                "materialized gzip archive entry"
            );
            return Ok(Self::build(
                archive_path,
                name,
                data.len() as u64,
                true,
                Backing::Materialized(Arc::new(RwLock::new(data))),
            ));
        }

        let located = locate_entry(&file, candidates)
            .wrap_err_with(|| format!("in archive '{}'", archive_path.display()))?;
        debug!(
            archive = %archive_path.display(),
            entry = %located.name,
            offset = located.offset,
            size = located.size,
            "located tar archive entry"
        );

        Ok(Self::build(
            archive_path,
            located.name,
            located.size,
            false,
            Backing::Mapped {
                file: Arc::new(file),
                base: located.offset,
            },
        ))
    }

    fn build(archive_path: &Path, entry_name: String, size: u64, compressed: bool, backing: Backing) -> Self {
        Self {
            inner: Arc::new(ArchiveInner {
                archive_path: archive_path.to_path_buf(),
                entry_name,
                size,
                compressed,
                backing: RwLock::new(Some(backing)),
                regions: RegionTable::default(),
            }),
        }
    }

    /// Normalized member name as it appears in the archive.
    pub fn entry_name(&self) -> &str {
        &self.inner.entry_name
    }

    pub fn archive_path(&self) -> &Path {
        &self.inner.archive_path
    }

    /// True when the member was decompressed from a gzip archive.
    pub fn is_compressed(&self) -> bool {
        self.inner.compressed
    }
}

impl Storage for ArchiveStorage {
    fn map(&self, offset: u64, length: u64) -> Result<Region> {
        let backing = self.inner.backing.read();
        let backing = backing
            .as_ref()
            .ok_or_else(|| StorageError::closed(BACKEND))?;

        let length = resolve_range(BACKEND, offset, length, self.inner.size)?;

        let region = match backing {
            Backing::Mapped { file, base } => {
                let length = usize::try_from(length).map_err(|_| {
                    StorageError::invalid_argument(format!(
                        "{}: region too large ({} bytes)",
                        BACKEND, length
                    ))
                })?;
                let segment = Segment::map(file, base + offset, length, true).wrap_err_with(|| {
                    format!(
                        "failed to map entry {} of '{}'",
                        self.inner.entry_name,
                        self.inner.archive_path.display()
                    )
                })?;
                Region::mapped(offset, segment, true)
            }
            Backing::Materialized(buffer) => {
                let range = offset as usize..(offset + length) as usize;
                Region::buffered(Arc::clone(buffer), range, true)
            }
        };

        self.inner.regions.track(&region);
        Ok(region)
    }

    fn size(&self) -> Result<u64> {
        if self.inner.backing.read().is_none() {
            return Err(StorageError::closed(BACKEND).into());
        }
        Ok(self.inner.size)
    }

    fn grow(&self, _new_size: u64) -> Result<()> {
        if self.inner.backing.read().is_none() {
            return Err(StorageError::closed(BACKEND).into());
        }
        Err(StorageError::unsupported(format!(
            "{}: cannot grow {}; open it writable to stage changes",
            BACKEND, self.inner.entry_name
        ))
        .into())
    }

    fn close(&self) -> Result<()> {
        let mut backing = self.inner.backing.write();
        if backing.is_none() {
            return Ok(());
        }

        let result = self.inner.regions.release_all();
        *backing = None;
        result
    }

    fn reader_writer_seeker(&self) -> Result<Box<dyn StorageStream>> {
        if self.inner.backing.read().is_none() {
            return Err(StorageError::closed(BACKEND).into());
        }

        Ok(Box::new(ArchiveView {
            inner: Arc::clone(&self.inner),
            pos: 0,
        }))
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn is_closed(&self) -> bool {
        self.inner.backing.read().is_none()
    }
}

/// Read-only byte stream over an archive member. Seeks stay within the
/// member.
#[derive(Debug)]
pub struct ArchiveView {
    inner: Arc<ArchiveInner>,
    pos: u64,
}

impl Read for ArchiveView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let backing = self.inner.backing.read();
        let backing = backing
            .as_ref()
            .ok_or_else(|| StorageError::closed(BACKEND).into_io())?;

        let size = self.inner.size;
        if self.pos >= size {
            return Ok(0);
        }
        let remaining = usize::try_from(size - self.pos).unwrap_or(usize::MAX);
        let want = buf.len().min(remaining);

        let n = match backing {
            Backing::Mapped { file, base } => platform::read_at(file, &mut buf[..want], base + self.pos)?,
            Backing::Materialized(buffer) => {
                let data = buffer.read();
                let start = self.pos as usize;
                buf[..want].copy_from_slice(&data[start..start + want]);
                want
            }
        };

        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for ArchiveView {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(StorageError::read_only(format!(
            "{}: {} is read-only",
            BACKEND, self.inner.entry_name
        ))
        .into_io())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ArchiveView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.inner.backing.read().is_none() {
            return Err(StorageError::closed(BACKEND).into_io());
        }
        self.pos = resolve_seek(BACKEND, pos, self.pos, self.inner.size, true)?;
        Ok(self.pos)
    }
}
