//! # Tar Archive Factory
//!
//! A [`StorageFactory`] that serves loose files and tar archive members
//! through one entry point. Resolution for a logical path:
//!
//! 1. a path already staged for writing returns a handle onto its staging
//!    buffer
//! 2. a regular file at the path is opened directly through the file backend
//! 3. a read-only open resolves the archive member (mmap for plain tar,
//!    materialized for gzip)
//! 4. a writable open stages the member's current bytes (or nothing, for a
//!    new member) in a memory buffer
//!
//! ## Staging
//!
//! ```text
//!   path_index: logical path ──► member name
//!   dirty:      member name  ──► WritableEntry { buffer }
//! ```
//!
//! Both maps live behind one mutex that is only held for lookups and
//! inserts, never across archive I/O. Logical paths that normalize to the
//! same member share one entry.
//!
//! Staged handles are plain memory storages over the shared buffer. Closing
//! one invalidates that handle; the staged bytes stay until `commit()` writes
//! them into the archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::entry::ArchiveStorage;
use super::names::entry_candidates;
use super::scan::read_entry;
use crate::config::DEFAULT_ENTRY_MODE;
use crate::error::{is_not_found, StorageError};
use crate::storage::{AnyStorage, Capacity, FileStorage, MemoryStorage, SharedBuffer, StorageFactory};

/// A member opened for writing and not yet committed.
#[derive(Debug)]
pub(super) struct WritableEntry {
    pub entry_name: String,
    pub buffer: SharedBuffer,
}

impl WritableEntry {
    fn open(&self, read_only: bool) -> AnyStorage {
        AnyStorage::Memory(MemoryStorage::from_shared(
            Arc::clone(&self.buffer),
            read_only,
            Capacity::Growable,
        ))
    }
}

#[derive(Debug, Default)]
pub(super) struct StagingTable {
    pub dirty: HashMap<String, Arc<WritableEntry>>,
    pub path_index: HashMap<PathBuf, String>,
}

impl StagingTable {
    fn lookup(&self, path: &Path) -> Option<Arc<WritableEntry>> {
        let name = self.path_index.get(path)?;
        self.dirty.get(name).cloned()
    }
}

#[derive(Debug)]
pub(super) struct FactoryInner {
    pub archive_path: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub entry_mode: u32,
    pub staged: Mutex<StagingTable>,
    pub commit_lock: Mutex<()>,
}

/// Storage factory over a tar or tar.gz archive.
///
/// Cloning is cheap and clones share staged state, so a clone handed to a
/// consumer as its factory can be committed through the original.
#[derive(Debug, Clone)]
pub struct TarFactory {
    pub(super) inner: Arc<FactoryInner>,
}

impl TarFactory {
    /// Factory over the archive at `archive_path` with default settings.
    pub fn new<P: Into<PathBuf>>(archive_path: P) -> Self {
        Self::builder().archive_path(archive_path).build()
    }

    pub fn builder() -> TarFactoryBuilder {
        TarFactoryBuilder::default()
    }

    /// A cloneable closure form of this factory.
    pub fn factory(&self) -> impl StorageFactory + Clone {
        let this = self.clone();
        move |path: &Path, read_only: bool| this.resolve(path, read_only)
    }

    pub fn archive_path(&self) -> Option<&Path> {
        self.inner.archive_path.as_deref()
    }

    /// Staged member names, sorted.
    pub fn dirty_entries(&self) -> Vec<String> {
        let staged = self.inner.staged.lock();
        let mut names: Vec<String> = staged.dirty.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_staged<P: AsRef<Path>>(&self, path: P) -> bool {
        self.inner.staged.lock().lookup(path.as_ref()).is_some()
    }

    fn resolve(&self, path: &Path, read_only: bool) -> Result<AnyStorage> {
        let cached = self.inner.staged.lock().lookup(path);
        if let Some(entry) = cached {
            debug!(path = %path.display(), entry = %entry.entry_name, read_only, "reusing staged entry");
            return Ok(entry.open(read_only));
        }

        if path.as_os_str().is_empty() {
            return Err(StorageError::invalid_argument("tar storage: path cannot be empty").into());
        }

        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                debug!(path = %path.display(), read_only, "serving loose file");
                let storage = FileStorage::open_existing(path, read_only)?;
                return Ok(AnyStorage::File(storage));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("tar storage: failed to stat '{}'", path.display()))
            }
        }

        let candidates = entry_candidates(path);
        if candidates.is_empty() {
            return Err(StorageError::invalid_argument(format!(
                "tar storage: unable to derive archive entry for '{}'",
                path.display()
            ))
            .into());
        }

        if read_only {
            let archive_path = self.inner.archive_path.as_deref().ok_or_else(|| {
                StorageError::invalid_argument("tar storage: archive not configured")
            })?;
            let storage = ArchiveStorage::open(archive_path, &candidates)?;
            return Ok(AnyStorage::Archive(storage));
        }

        let entry = self.prepare_writable(path, &candidates)?;
        Ok(entry.open(false))
    }

    fn prepare_writable(&self, path: &Path, candidates: &[String]) -> Result<Arc<WritableEntry>> {
        {
            let mut staged = self.inner.staged.lock();
            let shared = candidates
                .iter()
                .find_map(|name| staged.dirty.get(name).cloned());
            if let Some(entry) = shared {
                debug!(
                    path = %path.display(),
                    entry = %entry.entry_name,
                    "sharing staged entry with another path"
                );
                staged
                    .path_index
                    .insert(path.to_path_buf(), entry.entry_name.clone());
                return Ok(entry);
            }
        }

        let (data, entry_name) = match self.inner.archive_path.as_deref() {
            Some(archive_path) => match read_entry(archive_path, candidates) {
                Ok(found) => found,
                Err(err) if is_not_found(&err) => (Vec::new(), new_member_name(path, candidates)),
                Err(err) => return Err(err),
            },
            None => (Vec::new(), new_member_name(path, candidates)),
        };

        debug!(
            path = %path.display(),
            entry = %entry_name,
            size = data.len(),
            "staged archive entry for writing"
        );

        let mut staged = self.inner.staged.lock();
        let entry = staged
            .dirty
            .entry(entry_name.clone())
            .or_insert_with(|| {
                Arc::new(WritableEntry {
                    entry_name: entry_name.clone(),
                    buffer: Arc::new(RwLock::new(data)),
                })
            })
            .clone();
        staged.path_index.insert(path.to_path_buf(), entry_name);
        Ok(entry)
    }
}

impl StorageFactory for TarFactory {
    fn open(&self, path: &Path, read_only: bool) -> Result<AnyStorage> {
        self.resolve(path, read_only)
    }
}

/// Member name for a path absent from the archive. Relative paths keep
/// their directories; rooted paths and paths that climb out with `..` are
/// stored under their base name.
fn new_member_name(path: &Path, candidates: &[String]) -> String {
    let relative = candidates
        .iter()
        .find(|name| !name.split('/').any(|part| part == ".."));

    match relative {
        Some(name) if !path.has_root() => name.clone(),
        _ => candidates.last().cloned().unwrap_or_default(),
    }
}

/// Configures a [`TarFactory`].
///
/// ```ignore
/// let tars = TarFactory::builder()
///     .archive_path("graph.tar.gz")
///     .scratch_dir("/var/tmp")
///     .entry_mode(0o600)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TarFactoryBuilder {
    archive_path: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    entry_mode: u32,
}

impl Default for TarFactoryBuilder {
    fn default() -> Self {
        Self {
            archive_path: None,
            scratch_dir: None,
            entry_mode: DEFAULT_ENTRY_MODE,
        }
    }
}

impl TarFactoryBuilder {
    /// Archive to read from and commit to. Surrounding whitespace is ignored;
    /// an empty path leaves the factory without an archive.
    pub fn archive_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path: PathBuf = path.into();
        let trimmed = path.to_string_lossy().trim().to_string();
        self.archive_path = if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        };
        self
    }

    /// Directory for commit temp files. Must be on the archive's filesystem
    /// for the final rename to be atomic. Defaults to the archive's directory.
    pub fn scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Mode bits written on members produced by commit.
    pub fn entry_mode(mut self, mode: u32) -> Self {
        self.entry_mode = mode;
        self
    }

    pub fn build(self) -> TarFactory {
        let scratch_dir = self.scratch_dir.unwrap_or_else(|| {
            self.archive_path
                .as_deref()
                .and_then(Path::parent)
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });

        TarFactory {
            inner: Arc::new(FactoryInner {
                archive_path: self.archive_path,
                scratch_dir,
                entry_mode: self.entry_mode,
                staged: Mutex::new(StagingTable::default()),
                commit_lock: Mutex::new(()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::storage::Storage;
    use tempfile::tempdir;

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        std::fs::write(path, builder.into_inner().unwrap()).unwrap();
    }

    #[test]
    fn builder_defaults_scratch_dir_to_archive_parent() {
        let tars = TarFactory::new("/data/graphs/graph.tar");

        assert_eq!(tars.inner.scratch_dir, PathBuf::from("/data/graphs"));
        assert_eq!(tars.inner.entry_mode, DEFAULT_ENTRY_MODE);

        let bare = TarFactory::new("graph.tar");
        assert_eq!(bare.inner.scratch_dir, PathBuf::from("."));
    }

    #[test]
    fn blank_archive_path_is_unconfigured() {
        let tars = TarFactory::new("   ");

        assert!(tars.archive_path().is_none());
    }

    #[test]
    fn read_only_without_archive_is_invalid() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::builder().build();

        let err = tars.open(&dir.path().join("nodes.graph"), true).unwrap_err();

        assert_eq!(error_kind(&err), ErrorKind::InvalidArgument);
    }

    #[test]
    fn empty_path_is_invalid() {
        let tars = TarFactory::new("graph.tar");

        let err = tars.open(Path::new(""), true).unwrap_err();

        assert_eq!(error_kind(&err), ErrorKind::InvalidArgument);
    }

    #[test]
    fn writable_open_of_new_member_starts_empty() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::new(dir.path().join("absent.tar"));

        let storage = tars.open(&dir.path().join("nodes.graph"), false).unwrap();

        assert!(storage.is_memory());
        assert_eq!(storage.size().unwrap(), 0);
        assert!(tars.is_staged(dir.path().join("nodes.graph")));
    }

    #[test]
    fn writable_open_seeds_existing_bytes() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        write_tar(&archive, &[("nodes.graph", b"aaaaaaaaaaaa")]);
        let tars = TarFactory::new(&archive);

        let storage = tars.open(&dir.path().join("nodes.graph"), false).unwrap();

        assert_eq!(&*storage.map(0, 0).unwrap().bytes().unwrap(), b"aaaaaaaaaaaa");
        assert_eq!(tars.dirty_entries(), vec!["nodes.graph".to_string()]);
    }

    #[test]
    fn staged_entry_survives_handle_close() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::new(dir.path().join("graph.tar"));
        let path = dir.path().join("nodes.graph");

        let first = tars.open(&path, false).unwrap();
        first.grow(4).unwrap();
        first.map(0, 4).unwrap().bytes_mut().unwrap().copy_from_slice(b"abcd");
        first.close().unwrap();

        let second = tars.open(&path, true).unwrap();
        assert!(second.is_read_only());
        assert_eq!(&*second.map(0, 0).unwrap().bytes().unwrap(), b"abcd");
    }

    #[test]
    fn paths_naming_one_member_share_staging() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::new(dir.path().join("graph.tar"));

        let a = tars.open(Path::new("nodes.graph"), false).unwrap();
        let b = tars.open(Path::new("./nodes.graph"), false).unwrap();
        a.grow(3).unwrap();

        assert_eq!(b.size().unwrap(), 3);
        assert_eq!(tars.dirty_entries().len(), 1);
        assert!(tars.is_staged("./nodes.graph"));
    }

    #[test]
    fn new_member_names_avoid_parent_segments() {
        let path = Path::new("../shared/nodes.graph");
        assert_eq!(new_member_name(path, &entry_candidates(path)), "nodes.graph");

        let path = Path::new("data/nodes.graph");
        assert_eq!(new_member_name(path, &entry_candidates(path)), "data/nodes.graph");
    }

    #[test]
    fn rooted_paths_stage_under_base_name() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::new(dir.path().join("graph.tar"));

        tars.open(&dir.path().join("nodes.graph"), false).unwrap();

        assert_eq!(tars.dirty_entries(), vec!["nodes.graph".to_string()]);
    }

    #[test]
    fn closure_factory_shares_state() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::new(dir.path().join("graph.tar"));
        let factory = tars.factory();

        factory.open(Path::new("edges.graph"), false).unwrap();

        assert!(tars.is_staged("edges.graph"));
    }
}
