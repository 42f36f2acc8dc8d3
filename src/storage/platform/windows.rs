//! Win32 segment mapper: `CreateFileMapping`/`MapViewOfFile` aligned to the
//! system allocation granularity, which is queried once per process.

use std::fs::File;
use std::io;
use std::os::windows::fs::FileExt;
use std::path::Path;
use std::sync::OnceLock;

use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use ::windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::SegmentMapper;
use crate::config::WINDOWS_FALLBACK_ALLOCATION_GRANULARITY;

static ALLOCATION_GRANULARITY: OnceLock<u64> = OnceLock::new();

#[derive(Debug)]
pub(crate) struct Win32Mapper;

impl SegmentMapper for Win32Mapper {
    fn granularity() -> u64 {
        *ALLOCATION_GRANULARITY.get_or_init(|| {
            let mut info = SYSTEM_INFO::default();
            // SAFETY: GetSystemInfo fills the caller-provided struct and cannot
            // fail; `info` is a valid, exclusively borrowed SYSTEM_INFO.
            unsafe { GetSystemInfo(&mut info) };
            match info.dwAllocationGranularity {
                0 => WINDOWS_FALLBACK_ALLOCATION_GRANULARITY,
                granularity => granularity as u64,
            }
        })
    }

    fn flush(map: &MmapMut, file: &File) -> Result<()> {
        map.flush().wrap_err("FlushViewOfFile failed")?;
        file.sync_all().wrap_err("FlushFileBuffers failed")
    }
}

pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

pub(crate) fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// NTFS journals the rename itself; there is no directory handle to flush.
pub(crate) fn sync_directory(_dir: &Path) -> Result<()> {
    Ok(())
}
