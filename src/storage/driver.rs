//! # Storage Driver Layer
//!
//! Ties the backends together for code that should not care which one it
//! gets:
//!
//! - [`AnyStorage`]: type-erased storage, one variant per backend, that
//!   implements [`Storage`] by dispatch
//! - [`StorageFactory`]: the `(logical_path, read_only) -> Storage` contract
//!   that higher layers (e.g. a graph persistence format) depend on
//! - [`StorageKind`]: configuration value that picks a factory at startup
//!
//! ## Factories
//!
//! Any `Fn(&Path, bool) -> Result<AnyStorage> + Send + Sync` closure is a
//! factory, so callers can adapt or wrap factories freely:
//!
//! ```ignore
//! let files = mapstore::file_factory();
//! let storage = files.open(Path::new("nodes.graph"), false)?;
//! storage.grow(4096)?;
//! ```
//!
//! | Factory            | Backend                 | Path             |
//! |--------------------|-------------------------|------------------|
//! | `file_factory()`   | File                    | opened/created   |
//! | `memory_factory()` | Memory (fresh, empty)   | ignored          |
//! | `flash_factory()`  | Memory (fixed, shared)  | ignored          |
//! | `TarFactory`       | File, Archive or Memory | resolved, see `archive` |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use parking_lot::RwLock;

use super::file::FileStorage;
use super::memory::{Capacity, MemoryStorage};
use super::region::Region;
use super::{Storage, StorageStream};
use crate::archive::{ArchiveStorage, TarFactory};

/// Opens storage for a logical path.
pub trait StorageFactory: Send + Sync {
    fn open(&self, path: &Path, read_only: bool) -> Result<AnyStorage>;
}

impl<F> StorageFactory for F
where
    F: Fn(&Path, bool) -> Result<AnyStorage> + Send + Sync,
{
    fn open(&self, path: &Path, read_only: bool) -> Result<AnyStorage> {
        self(path, read_only)
    }
}

/// Files opened read-write (and created) or read-only as requested.
pub fn file_factory() -> impl StorageFactory + Clone {
    |path: &Path, read_only: bool| FileStorage::open(path, read_only).map(AnyStorage::File)
}

/// A fresh, empty growable buffer per call.
pub fn memory_factory() -> impl StorageFactory + Clone {
    |_path: &Path, _read_only: bool| -> Result<AnyStorage> {
        Ok(AnyStorage::Memory(MemoryStorage::new(0)))
    }
}

/// Every call opens a handle onto the same fixed-capacity image, such as a
/// flash region. `read_only` is decided here, not per call.
pub fn flash_factory(data: Vec<u8>, read_only: bool) -> impl StorageFactory + Clone {
    let image = Arc::new(RwLock::new(data));
    move |_path: &Path, _read_only: bool| -> Result<AnyStorage> {
        Ok(AnyStorage::Memory(MemoryStorage::from_shared(
            Arc::clone(&image),
            read_only,
            Capacity::Fixed,
        )))
    }
}

/// Backend selection for components that build their own factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    File,
    Memory,
    /// Loose files first, then members of the tar (or tar.gz) archive.
    Archive {
        path: PathBuf,
    },
}

impl StorageKind {
    pub fn archive<P: Into<PathBuf>>(path: P) -> Self {
        StorageKind::Archive { path: path.into() }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, StorageKind::Archive { .. })
    }

    pub fn archive_path(&self) -> Option<&Path> {
        match self {
            StorageKind::Archive { path } => Some(path),
            StorageKind::File | StorageKind::Memory => None,
        }
    }

    /// Builds the factory. Archive-backed kinds stage writes in memory; keep a
    /// [`TarFactory`] yourself if you need to `commit()` them.
    pub fn into_factory(self) -> Box<dyn StorageFactory> {
        match self {
            StorageKind::File => Box::new(file_factory()),
            StorageKind::Memory => Box::new(memory_factory()),
            StorageKind::Archive { path } => Box::new(TarFactory::new(path)),
        }
    }
}

/// Type-erased storage handed out by factories.
#[derive(Debug)]
pub enum AnyStorage {
    File(FileStorage),
    Memory(MemoryStorage),
    Archive(ArchiveStorage),
}

impl AnyStorage {
    pub fn backend_name(&self) -> &'static str {
        match self {
            AnyStorage::File(_) => "file",
            AnyStorage::Memory(_) => "memory",
            AnyStorage::Archive(_) => "archive",
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, AnyStorage::File(_))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, AnyStorage::Memory(_))
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, AnyStorage::Archive(_))
    }

    pub fn as_file(&self) -> Option<&FileStorage> {
        match self {
            AnyStorage::File(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryStorage> {
        match self {
            AnyStorage::Memory(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_archive(&self) -> Option<&ArchiveStorage> {
        match self {
            AnyStorage::Archive(s) => Some(s),
            _ => None,
        }
    }
}

impl Storage for AnyStorage {
    fn map(&self, offset: u64, length: u64) -> Result<Region> {
        match self {
            AnyStorage::File(s) => s.map(offset, length),
            AnyStorage::Memory(s) => s.map(offset, length),
            AnyStorage::Archive(s) => s.map(offset, length),
        }
    }

    fn size(&self) -> Result<u64> {
        match self {
            AnyStorage::File(s) => s.size(),
            AnyStorage::Memory(s) => s.size(),
            AnyStorage::Archive(s) => s.size(),
        }
    }

    fn grow(&self, new_size: u64) -> Result<()> {
        match self {
            AnyStorage::File(s) => s.grow(new_size),
            AnyStorage::Memory(s) => s.grow(new_size),
            AnyStorage::Archive(s) => s.grow(new_size),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            AnyStorage::File(s) => s.close(),
            AnyStorage::Memory(s) => s.close(),
            AnyStorage::Archive(s) => s.close(),
        }
    }

    fn reader_writer_seeker(&self) -> Result<Box<dyn StorageStream>> {
        match self {
            AnyStorage::File(s) => s.reader_writer_seeker(),
            AnyStorage::Memory(s) => s.reader_writer_seeker(),
            AnyStorage::Archive(s) => s.reader_writer_seeker(),
        }
    }

    fn is_read_only(&self) -> bool {
        match self {
            AnyStorage::File(s) => s.is_read_only(),
            AnyStorage::Memory(s) => s.is_read_only(),
            AnyStorage::Archive(s) => s.is_read_only(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            AnyStorage::File(s) => s.is_closed(),
            AnyStorage::Memory(s) => s.is_closed(),
            AnyStorage::Archive(s) => s.is_closed(),
        }
    }
}
