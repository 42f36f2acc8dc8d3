//! # Archive Module
//!
//! Serves storages out of a tar or gzip-compressed tar archive and writes
//! changes back atomically.
//!
//! ## Read Path
//!
//! ```text
//! logical path ──► candidates ──► gzip magic? ──► no:  locate header, mmap payload in place
//!                                             └─► yes: decompress, materialize payload
//! ```
//!
//! ## Write Path
//!
//! A writable open stages the member's bytes in memory. Staged members are
//! invisible to the archive file until [`TarFactory::commit`] rewrites it to
//! a temp file and renames that over the original.
//!
//! ## Usage
//!
//! ```ignore
//! use mapstore::{Storage, StorageFactory, TarFactory};
//!
//! let tars = TarFactory::new("graph.tar.gz");
//! let storage = tars.open(Path::new("nodes.graph"), false)?;
//! storage.grow(4096)?;
//! storage.map(0, 0)?.bytes_mut()?.fill(0xAB);
//! storage.close()?;
//! tars.commit()?;
//! ```

mod commit;
mod entry;
mod factory;
mod names;
mod scan;

pub use entry::{ArchiveStorage, ArchiveView};
pub use factory::{TarFactory, TarFactoryBuilder};
pub use names::{entry_candidates, normalize_entry_name};
