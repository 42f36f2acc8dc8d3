//! # Archive Scanning
//!
//! Locates members inside a tar archive that may or may not be gzip-wrapped.
//! The two physical encodings take different paths:
//!
//! ```text
//!             ┌──────────── first two bytes == 1F 8B ? ────────────┐
//!             │ no                                                 │ yes
//!   plain tar: seek header to header,              gzip: decompress sequentially,
//!   report the payload's byte offset in the        materialize the matching
//!   archive file so it can be mmapped in place     payload into one buffer
//! ```
//!
//! Only regular-file members match. A scan that reaches the end of the
//! archive without a match fails with `NotFound`, distinguishable from I/O and
//! format failures so writable opens can start a fresh member.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use eyre::{Result, WrapErr};
use flate2::read::MultiGzDecoder;
use tar::Archive;
use tracing::trace;

use super::names::normalize_entry_name;
use crate::config::GZIP_MAGIC;
use crate::error::StorageError;
use crate::storage::platform;

/// A plain-tar member located by byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocatedEntry {
    pub name: String,
    /// Offset of the first payload byte within the archive file.
    pub offset: u64,
    pub size: u64,
}

/// Sniffs the gzip magic. Files shorter than two bytes are not gzip.
pub(crate) fn detect_gzip(file: &File) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut filled = 0;

    while filled < magic.len() {
        match platform::read_at(file, &mut magic[filled..], filled as u64) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err).wrap_err("failed to read archive header"),
        }
    }

    Ok(magic == GZIP_MAGIC)
}

/// Finds the first regular member matching a candidate in a plain tar.
pub(crate) fn locate_entry(file: &File, candidates: &[String]) -> Result<LocatedEntry> {
    let mut reader = file;
    reader
        .seek(SeekFrom::Start(0))
        .wrap_err("failed to rewind archive")?;

    let mut archive = Archive::new(reader);
    let entries = archive
        .entries_with_seek()
        .map_err(|err| header_error(err, "failed to read tar header"))?;

    for entry in entries {
        let entry = entry.map_err(|err| header_error(err, "failed to read tar header"))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = normalize_entry_name(&String::from_utf8_lossy(&entry.path_bytes()));
        trace!(entry = %name, size = entry.size(), "scanned tar header");

        if candidates.contains(&name) {
            return Ok(LocatedEntry {
                name,
                offset: entry.raw_file_position(),
                size: entry.size(),
            });
        }
    }

    Err(not_found(candidates))
}

/// Decompresses a gzip-wrapped tar and materializes the first matching member.
pub(crate) fn load_gzip_entry(file: &File, candidates: &[String]) -> Result<(Vec<u8>, String)> {
    let mut reader = file;
    reader
        .seek(SeekFrom::Start(0))
        .wrap_err("failed to rewind archive")?;

    let mut archive = Archive::new(MultiGzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|err| header_error(err, "failed to open gzip stream"))?;

    for entry in entries {
        let mut entry = entry.map_err(|err| header_error(err, "failed to read tar header"))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = normalize_entry_name(&String::from_utf8_lossy(&entry.path_bytes()));
        trace!(entry = %name, size = entry.size(), "scanned gzip tar header");

        if !candidates.contains(&name) {
            continue;
        }

        let size = entry.size();
        let capacity = usize::try_from(size).map_err(|_| {
            StorageError::format(format!(
                "entry {} too large ({} bytes) to materialize in memory",
                name, size
            ))
        })?;

        let mut data = Vec::with_capacity(capacity);
        entry
            .read_to_end(&mut data)
            .map_err(|err| header_error(err, &format!("failed to read entry {}", name)))?;

        if data.len() != capacity {
            return Err(StorageError::format(format!(
                "entry {} truncated: expected {} bytes, read {}",
                name,
                size,
                data.len()
            ))
            .into());
        }

        return Ok((data, name));
    }

    Err(not_found(candidates))
}

/// Reads the current bytes of the first matching member, whatever the
/// archive's encoding. A missing archive file reports `NotFound`.
pub(crate) fn read_entry(archive_path: &Path, candidates: &[String]) -> Result<(Vec<u8>, String)> {
    let file = File::open(archive_path)
        .wrap_err_with(|| format!("failed to open archive '{}'", archive_path.display()))?;

    if detect_gzip(&file)? {
        return load_gzip_entry(&file, candidates);
    }

    let located = locate_entry(&file, candidates)?;
    let len = usize::try_from(located.size).map_err(|_| {
        StorageError::format(format!(
            "entry {} too large ({} bytes) to stage in memory",
            located.name, located.size
        ))
    })?;

    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match platform::read_at(&file, &mut data[filled..], located.offset + filled as u64) {
            Ok(0) => {
                return Err(StorageError::format(format!(
                    "entry {} truncated: expected {} bytes, read {}",
                    located.name, len, filled
                ))
                .into())
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("failed to read entry {}", located.name))
            }
        }
    }

    Ok((data, located.name))
}

fn not_found(candidates: &[String]) -> eyre::Report {
    StorageError::not_found(format!("no archive entry matches {:?}", candidates)).into()
}

/// Tar and gzip decoding failures surface as `io::Error`; report them as
/// format errors.
fn header_error(err: io::Error, context: &str) -> eyre::Report {
    StorageError::format(format!("{}: {}", context, err)).into()
}
