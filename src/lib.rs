//! # mapstore - Memory-Mappable Storage Extents
//!
//! mapstore hands out byte-addressable extents that can be mapped into
//! memory and read or written in place, whether the bytes live in a file, in
//! a memory buffer, or inside a tar archive. Consumers see one contract:
//!
//! - **Zero-copy access**: regions are direct mmap views or views of the
//!   live buffer, never copies
//! - **One factory signature**: `(logical_path, read_only) -> Storage`, so a
//!   persistence format never learns which backend it got
//! - **Atomic archive write-back**: archive members are staged in memory and
//!   committed by rewriting the archive to a temp file and renaming it
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::path::Path;
//! use mapstore::{file_factory, Storage, StorageFactory};
//!
//! let files = file_factory();
//! let storage = files.open(Path::new("./nodes.graph"), false)?;
//! storage.grow(4096)?;
//!
//! let region = storage.map(0, 16)?;
//! region.bytes_mut()?.copy_from_slice(b"graph header....");
//! region.sync()?;
//! storage.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  StorageFactory (file / memory / flash / tar)   │
//! ├─────────────────────────────────────────────────┤
//! │  AnyStorage: Storage + Region contract          │
//! ├───────────────┬───────────────┬─────────────────┤
//! │  FileStorage  │ MemoryStorage │ ArchiveStorage  │
//! ├───────────────┴───────────────┼─────────────────┤
//! │  Segment Mapper (POSIX/Win32) │   tar / gzip    │
//! └───────────────────────────────┴─────────────────┘
//! ```
//!
//! ## Archives
//!
//! [`TarFactory`] resolves a logical path to a loose file if one exists, and
//! otherwise to a member of its archive: mapped in place for plain tar,
//! decompressed into memory for tar.gz. Writable opens stage the member;
//! [`TarFactory::commit`] writes all staged members back.
//!
//! ## Errors
//!
//! Every fallible call returns `eyre::Result`. Use [`error_kind`] to classify
//! a failure (`NotFound`, `ReadOnlyViolation`, ...) without string matching.
//!
//! ## Module Overview
//!
//! - [`storage`]: the `Storage`/`Region` contract, file and memory backends,
//!   factories and the platform segment mapper
//! - [`archive`]: tar/tar.gz member storage, staging and commit
//! - [`error`]: error kinds and classification
//! - [`config`]: constants

pub mod archive;
pub mod config;
pub mod error;
pub mod storage;

pub use archive::{ArchiveStorage, TarFactory, TarFactoryBuilder};
pub use error::{error_kind, is_not_found, ErrorKind, StorageError};
pub use storage::{
    file_factory, flash_factory, memory_factory, AnyStorage, Capacity, FileStorage, MemoryStorage,
    Region, Storage, StorageFactory, StorageKind, StorageStream,
};
