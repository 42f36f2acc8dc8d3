//! # Archive Commit
//!
//! Writes staged members back into the archive. The archive is never
//! modified in place:
//!
//! ```text
//!   snapshot dirty set ──► temp file in scratch dir
//!                            │  (gzip-wrapped if the archive was)
//!                            ├─ untouched members, copied in order
//!                            ├─ staged members, sorted by name
//!                            └─ tar trailer, gzip trailer, fsync
//!                          rename temp ──► archive ──► fsync parent dir
//! ```
//!
//! Untouched members keep their PAX records. Long names are re-emitted
//! byte for byte.
//!
//! The rename is the only externally visible step. Any failure before it
//! drops the temp file (deleting it) and leaves the staging table as it was.
//! Entries staged after the snapshot are not part of this commit and remain
//! dirty. Bytes written to an already snapshotted entry while the rewrite is
//! running may miss the archive; reopen and commit again to pick them up.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use super::factory::{StagingTable, TarFactory, WritableEntry};
use super::names::normalize_entry_name;
use super::scan::detect_gzip;
use crate::config::TEMP_ARCHIVE_PREFIX;
use crate::error::StorageError;
use crate::storage::platform;

/// Temp-file writer matching the archive's compression.
enum ArchiveSink {
    Plain(BufWriter<NamedTempFile>),
    Gzip(GzEncoder<BufWriter<NamedTempFile>>),
}

impl ArchiveSink {
    fn new(temp: NamedTempFile, gzip: bool) -> Self {
        let writer = BufWriter::new(temp);
        if gzip {
            ArchiveSink::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            ArchiveSink::Plain(writer)
        }
    }

    /// Writes the gzip trailer (if any) and flushes down to the temp file.
    fn finish(self) -> io::Result<NamedTempFile> {
        let writer = match self {
            ArchiveSink::Plain(writer) => writer,
            ArchiveSink::Gzip(encoder) => encoder.finish()?,
        };
        writer.into_inner().map_err(|err| err.into_error())
    }
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveSink::Plain(writer) => writer.write(buf),
            ArchiveSink::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveSink::Plain(writer) => writer.flush(),
            ArchiveSink::Gzip(encoder) => encoder.flush(),
        }
    }
}

impl TarFactory {
    /// Rewrites the archive with every staged member and clears them from the
    /// staging table.
    ///
    /// A no-op when nothing is staged; the archive file is not touched. The
    /// archive keeps its compression: a gzip archive stays gzip, a plain or
    /// missing archive is written as plain tar. Commits on one factory are
    /// serialized.
    pub fn commit(&self) -> Result<()> {
        let _serial = self.inner.commit_lock.lock();

        let mut snapshot: Vec<Arc<WritableEntry>> = {
            let staged = self.inner.staged.lock();
            if staged.dirty.is_empty() {
                return Ok(());
            }
            staged.dirty.values().cloned().collect()
        };
        snapshot.sort_by(|a, b| a.entry_name.cmp(&b.entry_name));

        let archive_path = self.inner.archive_path.as_deref().ok_or_else(|| {
            StorageError::invalid_argument("tar storage: archive path is required for commit")
        })?;

        debug!(
            archive = %archive_path.display(),
            entries = snapshot.len(),
            "committing staged entries"
        );

        self.rewrite(archive_path, &snapshot)?;

        let mut staged = self.inner.staged.lock();
        let StagingTable { dirty, path_index } = &mut *staged;
        for entry in &snapshot {
            let committed = dirty
                .get(&entry.entry_name)
                .is_some_and(|current| Arc::ptr_eq(current, entry));
            if committed {
                dirty.remove(&entry.entry_name);
            }
        }
        path_index.retain(|_, name| dirty.contains_key(name));

        debug!(
            archive = %archive_path.display(),
            committed = snapshot.len(),
            remaining = dirty.len(),
            "commit finished"
        );
        Ok(())
    }

    fn rewrite(&self, archive_path: &Path, snapshot: &[Arc<WritableEntry>]) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix(TEMP_ARCHIVE_PREFIX)
            .tempfile_in(&self.inner.scratch_dir)
            .wrap_err_with(|| {
                format!(
                    "tar storage: failed to create temp archive in '{}'",
                    self.inner.scratch_dir.display()
                )
            })?;

        let source = match File::open(archive_path) {
            Ok(file) => Some(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).wrap_err_with(|| {
                    format!("tar storage: failed to open archive '{}'", archive_path.display())
                })
            }
        };

        let gzip = match &source {
            Some(file) => detect_gzip(file)?,
            None => false,
        };

        let mut builder = Builder::new(ArchiveSink::new(temp, gzip));

        let replaced: HashSet<&str> = snapshot.iter().map(|e| e.entry_name.as_str()).collect();
        let copied = match source {
            Some(file) => copy_untouched(&mut builder, file, gzip, &replaced)?,
            None => 0,
        };

        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        for entry in snapshot {
            append_staged(&mut builder, entry, self.inner.entry_mode, mtime)?;
        }

        let sink = builder
            .into_inner()
            .wrap_err("tar storage: failed to finish tar stream")?;
        let temp = sink
            .finish()
            .wrap_err("tar storage: failed to finish archive stream")?;
        temp.as_file()
            .sync_all()
            .wrap_err("tar storage: failed to sync temp archive")?;

        temp.persist(archive_path)
            .map_err(|err| err.error)
            .wrap_err_with(|| {
                format!(
                    "tar storage: failed to finalize archive '{}'",
                    archive_path.display()
                )
            })?;

        sync_archive_parent(archive_path);

        trace!(
            archive = %archive_path.display(),
            copied,
            replaced = snapshot.len(),
            gzip,
            "archive rewritten"
        );
        Ok(())
    }
}

/// Fsyncs the directory holding a freshly renamed archive. The rename has
/// already published the new archive, so a failure here is only logged.
fn sync_archive_parent(archive_path: &Path) {
    let parent = archive_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if let Err(err) = platform::sync_directory(&parent) {
        warn!(
            archive = %archive_path.display(),
            error = %err,
            "failed to sync archive directory after rename"
        );
    }
}

/// Copies every member not being replaced, in archive order. Returns how
/// many were copied.
fn copy_untouched<W: Write>(
    builder: &mut Builder<W>,
    mut source: File,
    gzip: bool,
    replaced: &HashSet<&str>,
) -> Result<usize> {
    source
        .seek(SeekFrom::Start(0))
        .wrap_err("tar storage: failed to rewind archive")?;

    let reader: Box<dyn Read> = if gzip {
        Box::new(MultiGzDecoder::new(source))
    } else {
        Box::new(source)
    };

    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| StorageError::format(format!("tar storage: failed to read archive: {}", err)))?;

    let mut copied = 0;
    for entry in entries {
        let mut entry = entry.map_err(|err| {
            StorageError::format(format!("tar storage: failed to read archive: {}", err))
        })?;

        let full_path = entry.path_bytes().into_owned();
        let name = normalize_entry_name(&String::from_utf8_lossy(&full_path));
        if replaced.contains(name.as_str()) {
            trace!(entry = %name, "dropping replaced member");
            continue;
        }

        let pax = pax_records(&mut entry, &name)?;
        let pax_has = |key: &str| pax.iter().any(|(k, _)| k == key);

        let mut header = entry.header().clone();
        let full_link = entry.link_name_bytes().map(|link| link.into_owned());
        let long_path = !pax_has("path") && &*header.path_bytes() != full_path.as_slice();
        let long_link = !pax_has("linkpath")
            && match (&full_link, header.link_name_bytes()) {
                (Some(full), Some(raw)) => full.as_slice() != &*raw,
                (Some(_), None) => true,
                (None, _) => false,
            };

        if !pax.is_empty() {
            builder
                .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                .wrap_err_with(|| format!("tar storage: failed to copy pax records of {}", name))?;
        }

        let path = path_from_bytes(&full_path);
        let result = match full_link {
            Some(link) if long_link => {
                builder.append_link(&mut header, &path, path_from_bytes(&link))
            }
            _ if long_path => builder.append_data(&mut header, &path, &mut entry),
            _ => builder.append(&header, &mut entry),
        };
        result.wrap_err_with(|| format!("tar storage: failed to copy member {}", name))?;

        trace!(entry = %name, "copied member");
        copied += 1;
    }

    Ok(copied)
}

/// PAX extended records attached to `entry`, in archive order.
fn pax_records<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    name: &str,
) -> Result<Vec<(String, Vec<u8>)>> {
    fn malformed(name: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::format(format!("tar storage: bad pax records on {}: {}", name, err))
    }

    let Some(extensions) = entry.pax_extensions().map_err(|err| malformed(name, err))? else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    for extension in extensions {
        let extension = extension.map_err(|err| malformed(name, err))?;
        let key = extension.key().map_err(|err| malformed(name, err))?;
        records.push((key.to_string(), extension.value_bytes().to_vec()));
    }
    Ok(records)
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

fn append_staged<W: Write>(
    builder: &mut Builder<W>,
    entry: &WritableEntry,
    mode: u32,
    mtime: u64,
) -> Result<()> {
    let data = entry.buffer.read();

    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_size(data.len() as u64);

    builder
        .append_data(&mut header, &entry.entry_name, data.as_slice())
        .wrap_err_with(|| format!("tar storage: failed to write member {}", entry.entry_name))?;

    trace!(entry = %entry.entry_name, size = data.len(), "wrote staged member");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::storage::{Storage, StorageFactory};
    use tempfile::tempdir;

    fn members(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn commit_without_staged_entries_is_noop() {
        let dir = tempdir().unwrap();
        let tars = TarFactory::builder().build();

        tars.commit().unwrap();

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn commit_without_archive_path_fails() {
        let tars = TarFactory::builder().build();
        tars.open(Path::new("commit-without-archive.graph"), false).unwrap();

        let err = tars.commit().unwrap_err();

        assert_eq!(error_kind(&err), ErrorKind::InvalidArgument);
        assert_eq!(tars.dirty_entries().len(), 1);
    }

    #[test]
    fn commit_creates_missing_archive() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        let tars = TarFactory::new(&archive);

        let storage = tars.open(&dir.path().join("nodes.graph"), false).unwrap();
        storage.grow(5).unwrap();
        storage.map(0, 0).unwrap().bytes_mut().unwrap().copy_from_slice(b"hello");
        storage.close().unwrap();
        tars.commit().unwrap();

        assert_eq!(members(&archive), vec![("nodes.graph".to_string(), b"hello".to_vec())]);
        assert!(tars.dirty_entries().is_empty());
        assert!(!tars.is_staged(dir.path().join("nodes.graph")));
    }

    #[test]
    fn commit_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        let tars = TarFactory::new(&archive);

        tars.open(&dir.path().join("a.graph"), false).unwrap();
        tars.commit().unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_ARCHIVE_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn commit_into_missing_scratch_dir_keeps_staging() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        let tars = TarFactory::builder()
            .archive_path(&archive)
            .scratch_dir(dir.path().join("missing"))
            .build();

        tars.open(&dir.path().join("nodes.graph"), false).unwrap();
        let err = tars.commit();

        assert!(err.is_err());
        assert!(!archive.exists());
        assert_eq!(tars.dirty_entries(), vec!["nodes.graph".to_string()]);
    }

    #[test]
    fn staged_members_use_configured_mode() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        let tars = TarFactory::builder()
            .archive_path(&archive)
            .entry_mode(0o600)
            .build();

        tars.open(&dir.path().join("nodes.graph"), false).unwrap();
        tars.commit().unwrap();

        let file = File::open(&archive).unwrap();
        let mut reader = Archive::new(file);
        let entry = reader.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap(), 0o600);
        assert_eq!(entry.header().entry_type(), EntryType::Regular);
    }

    #[test]
    fn long_member_names_survive_rewrite() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        let long_name = format!("{}/nodes.graph", "nested".repeat(30));

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        builder.append_data(&mut header, &long_name, &b"long"[..]).unwrap();
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let tars = TarFactory::new(&archive);
        tars.open(&dir.path().join("edges.graph"), false).unwrap();
        tars.commit().unwrap();

        assert_eq!(
            members(&archive),
            vec![
                (long_name, b"long".to_vec()),
                ("edges.graph".to_string(), Vec::new()),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_long_names_keep_their_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");
        let mut long_name = "nested/".repeat(20).into_bytes();
        long_name.extend_from_slice(b"\xffnodes.graph");

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, OsStr::from_bytes(&long_name), &b"raw!"[..])
            .unwrap();
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let tars = TarFactory::new(&archive);
        tars.open(&dir.path().join("edges.graph"), false).unwrap();
        tars.commit().unwrap();

        let file = File::open(&archive).unwrap();
        let mut reader = Archive::new(file);
        let mut entries = reader.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        assert_eq!(&*first.path_bytes(), long_name.as_slice());
    }

    fn pax_of(archive: &Path, member: &str) -> Vec<(String, Vec<u8>)> {
        let file = File::open(archive).unwrap();
        let mut reader = Archive::new(file);
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == member {
                return pax_records(&mut entry, member).unwrap();
            }
        }
        panic!("member {} not in archive", member);
    }

    #[test]
    fn pax_records_survive_rewrite() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");

        let mut builder = Builder::new(Vec::new());
        builder
            .append_pax_extensions([
                ("SCHILY.xattr.user.tag", &b"graph"[..]),
                ("mtime", &b"1700000000.25"[..]),
            ])
            .unwrap();
        let mut header = Header::new_ustar();
        header.set_size(4);
        header.set_mode(0o644);
        builder.append_data(&mut header, "meta.bin", &b"meta"[..]).unwrap();
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let before = pax_of(&archive, "meta.bin");
        assert_eq!(before.len(), 2);

        let tars = TarFactory::new(&archive);
        tars.open(&dir.path().join("nodes.graph"), false).unwrap();
        tars.commit().unwrap();

        assert_eq!(pax_of(&archive, "meta.bin"), before);
        assert_eq!(
            members(&archive),
            vec![
                ("meta.bin".to_string(), b"meta".to_vec()),
                ("nodes.graph".to_string(), Vec::new()),
            ]
        );
    }

    #[test]
    fn failed_rewrite_leaves_archive_and_staging_untouched() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("graph.tar");

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_ustar();
        header.set_size(1024);
        header.set_mode(0o644);
        builder.append_data(&mut header, "meta.bin", &[7u8; 1024][..]).unwrap();
        let mut bytes = builder.into_inner().unwrap();
        bytes.truncate(512 + 100);
        std::fs::write(&archive, &bytes).unwrap();

        let tars = TarFactory::new(&archive);
        tars.open(&dir.path().join("new.graph"), false).unwrap();
        assert!(tars.commit().is_err());

        let files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["graph.tar".to_string()]);
        assert_eq!(std::fs::read(&archive).unwrap(), bytes);
        assert_eq!(tars.dirty_entries(), vec!["new.graph".to_string()]);
    }

    #[test]
    fn parent_sync_failure_is_not_fatal() {
        let dir = tempdir().unwrap();

        sync_archive_parent(&dir.path().join("missing").join("graph.tar"));
    }
}
