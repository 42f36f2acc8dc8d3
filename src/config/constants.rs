//! # Configuration Constants
//!
//! ## Dependency Graph
//!
//! ```text
//! FALLBACK_PAGE_SIZE (4096)
//!       │
//!       └─> WINDOWS_FALLBACK_ALLOCATION_GRANULARITY (65536, must be a multiple)
//!             Mapping offsets are rounded down to the platform granularity.
//!             When the OS query fails we fall back to these values, and the
//!             Windows value must stay page aligned for the POSIX math to hold.
//!
//! GZIP_MAGIC (1F 8B)
//!       │
//!       └─> Sniffed from the first two archive bytes; commit preserves the
//!           compression form it finds.
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{GZIP_MAGIC, TEMP_ARCHIVE_PREFIX};
//! ```

/// RFC 1952 member header magic.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Prefix for the temp file a commit writes before renaming over the archive.
pub const TEMP_ARCHIVE_PREFIX: &str = "tar-archive-";

/// Mode bits on members appended by a commit.
pub const DEFAULT_ENTRY_MODE: u32 = 0o644;

/// Page size assumed when `sysconf(_SC_PAGESIZE)` reports nothing usable.
pub const FALLBACK_PAGE_SIZE: u64 = 4096;

/// Allocation granularity assumed when `GetSystemInfo` reports zero.
pub const WINDOWS_FALLBACK_ALLOCATION_GRANULARITY: u64 = 64 * 1024;

const _: () = assert!(
    FALLBACK_PAGE_SIZE.is_power_of_two(),
    "FALLBACK_PAGE_SIZE must be a power of two for offset alignment"
);

const _: () = assert!(
    WINDOWS_FALLBACK_ALLOCATION_GRANULARITY % FALLBACK_PAGE_SIZE == 0,
    "allocation granularity must be a multiple of the page size"
);

const _: () = assert!(
    DEFAULT_ENTRY_MODE <= 0o7777,
    "DEFAULT_ENTRY_MODE must only carry permission bits"
);
