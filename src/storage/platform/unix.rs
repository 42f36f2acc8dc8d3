//! POSIX segment mapper: `mmap`/`msync`/`munmap` with page-size alignment.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::OnceLock;

use eyre::{Result, WrapErr};
use memmap2::MmapMut;

use super::SegmentMapper;
use crate::config::FALLBACK_PAGE_SIZE;

static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

#[derive(Debug)]
pub(crate) struct PosixMapper;

impl SegmentMapper for PosixMapper {
    fn granularity() -> u64 {
        *PAGE_SIZE.get_or_init(|| {
            // SAFETY: sysconf only reads a system constant and has no
            // preconditions; a negative return signals "indeterminate".
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 {
                size as u64
            } else {
                FALLBACK_PAGE_SIZE
            }
        })
    }

    fn flush(map: &MmapMut, _file: &File) -> Result<()> {
        map.flush().wrap_err("msync failed")
    }
}

pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

pub(crate) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

/// Makes a completed rename in `dir` durable.
pub(crate) fn sync_directory(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .wrap_err_with(|| format!("failed to sync directory '{}'", dir.display()))
}
