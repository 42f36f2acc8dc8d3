//! # Storage Backend Test Suite
//!
//! Exercises the `Storage`/`Region` contract against the file and memory
//! backends through the public API only.
//!
//! ## Test Categories
//!
//! 1. **Map bounds**: lengths, zero-length maps, out-of-range requests
//! 2. **Aliasing**: writes through one region seen through another
//! 3. **Growth**: new maps reflect the grown size
//! 4. **Durability**: stream writes survive close and reopen
//! 5. **Lifecycle**: close is idempotent and invalidates handles
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test storage_backends
//! ```

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use mapstore::{
    error_kind, file_factory, flash_factory, memory_factory, AnyStorage, ErrorKind, FileStorage,
    MemoryStorage, Storage, StorageFactory, StorageKind,
};
use tempfile::tempdir;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn file_with(dir: &Path, data: &[u8]) -> FileStorage {
    let path = dir.join("data.bin");
    std::fs::write(&path, data).expect("Failed to seed file");
    FileStorage::open(&path, false).expect("Failed to open file storage")
}

/// Every backend seeded with the same bytes.
fn backends(dir: &Path, data: &[u8]) -> Vec<(&'static str, Box<dyn Storage>)> {
    let file: Box<dyn Storage> = Box::new(file_with(dir, data));
    let memory: Box<dyn Storage> = Box::new(MemoryStorage::with_data(data.to_vec()));
    vec![("file", file), ("memory", memory)]
}

// ============================================================================
// MAP BOUNDS
// ============================================================================

#[test]
fn map_returns_exact_ranges() {
    let dir = tempdir().unwrap();
    let data = pattern(10_000);

    for (name, storage) in backends(dir.path(), &data) {
        for (offset, length) in [(0u64, 1u64), (1, 4095), (4095, 2), (4096, 4096), (9_000, 1_000)] {
            let region = storage.map(offset, length).unwrap();
            let start = offset as usize;
            let end = start + length as usize;

            assert_eq!(region.size(), length, "{} size at {}", name, offset);
            assert_eq!(&*region.bytes().unwrap(), &data[start..end], "{} bytes at {}", name, offset);
        }
    }
}

#[test]
fn zero_length_maps_remaining_bytes() {
    let dir = tempdir().unwrap();
    let data = pattern(5_000);

    for (name, storage) in backends(dir.path(), &data) {
        let region = storage.map(4_321, 0).unwrap();

        assert_eq!(region.size(), 5_000 - 4_321, "{}", name);
        assert_eq!(&*region.bytes().unwrap(), &data[4_321..], "{}", name);
    }
}

#[test]
fn out_of_range_maps_fail_without_panicking() {
    let dir = tempdir().unwrap();
    let data = pattern(100);

    for (name, storage) in backends(dir.path(), &data) {
        for (offset, length) in [(101u64, 0u64), (100, 0), (50, 51), (0, 101), (u64::MAX, 1), (1, u64::MAX)] {
            let err = storage.map(offset, length).unwrap_err();
            assert_eq!(
                error_kind(&err),
                ErrorKind::InvalidArgument,
                "{} ({}, {})",
                name,
                offset,
                length
            );
        }
    }
}

#[test]
fn region_reads_match_stream_reads() {
    let dir = tempdir().unwrap();
    let data = pattern(3_000);

    for (name, storage) in backends(dir.path(), &data) {
        let region = storage.map(1_000, 700).unwrap();

        let mut view = storage.reader_writer_seeker().unwrap();
        view.seek(SeekFrom::Start(1_000)).unwrap();
        let mut independent = vec![0u8; 700];
        view.read_exact(&mut independent).unwrap();

        assert_eq!(&*region.bytes().unwrap(), independent.as_slice(), "{}", name);
    }
}

// ============================================================================
// ALIASING
// ============================================================================

#[test]
fn memory_regions_alias_overlapping_ranges() {
    let storage = MemoryStorage::new(64);

    let wide = storage.map(0, 32).unwrap();
    let narrow = storage.map(8, 8).unwrap();
    wide.bytes_mut().unwrap()[8..16].copy_from_slice(b"aliased!");

    assert_eq!(&*narrow.bytes().unwrap(), b"aliased!");

    narrow.bytes_mut().unwrap()[0] = b'A';
    assert_eq!(wide.bytes().unwrap()[8], b'A');
}

#[test]
fn file_region_writes_reach_disk_after_sync() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mapped.bin");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();

    let storage = FileStorage::open(&path, false).unwrap();
    let region = storage.map(4_100, 6).unwrap();
    region.bytes_mut().unwrap().copy_from_slice(b"synced");
    region.sync().unwrap();
    storage.close().unwrap();

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[4_100..4_106], b"synced");
}

// ============================================================================
// GROWTH
// ============================================================================

#[test]
fn grow_is_reflected_by_new_maps() {
    let dir = tempdir().unwrap();
    let data = pattern(128);

    for (name, storage) in backends(dir.path(), &data) {
        storage.grow(64).unwrap();
        assert_eq!(storage.size().unwrap(), 128, "{} shrank", name);

        storage.grow(10_000).unwrap();
        assert_eq!(storage.size().unwrap(), 10_000, "{}", name);

        let tail = storage.map(128, 0).unwrap();
        assert_eq!(tail.size(), 10_000 - 128, "{}", name);
        assert!(tail.bytes().unwrap().iter().all(|&b| b == 0), "{} tail not zeroed", name);
        assert_eq!(&*storage.map(0, 128).unwrap().bytes().unwrap(), data.as_slice(), "{}", name);
    }
}

#[test]
fn file_size_observes_external_growth() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.bin");
    std::fs::write(&path, b"1234").unwrap();

    let storage = FileStorage::open(&path, true).unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"5678").unwrap();
    file.sync_all().unwrap();

    assert_eq!(storage.size().unwrap(), 8);
    assert_eq!(&*storage.map(4, 4).unwrap().bytes().unwrap(), b"5678");
}

#[test]
fn read_only_storage_rejects_growth_and_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.bin");
    std::fs::write(&path, b"read only").unwrap();

    let file = FileStorage::open(&path, true).unwrap();
    assert_eq!(error_kind(&file.grow(100).unwrap_err()), ErrorKind::ReadOnlyViolation);
    assert_eq!(
        error_kind(&file.map(0, 0).unwrap().bytes_mut().unwrap_err()),
        ErrorKind::ReadOnlyViolation
    );
    assert!(file.reader_writer_seeker().unwrap().write_all(b"x").is_err());

    let flash = flash_factory(vec![0u8; 32], true)
        .open(Path::new("ignored"), false)
        .unwrap();
    assert_eq!(error_kind(&flash.grow(64).unwrap_err()), ErrorKind::Unsupported);
}

// ============================================================================
// DURABILITY
// ============================================================================

#[test]
fn stream_writes_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stream.bin");

    {
        let storage = FileStorage::open(&path, false).unwrap();
        storage.grow(32).unwrap();

        let mut view = storage.reader_writer_seeker().unwrap();
        view.seek(SeekFrom::Start(10)).unwrap();
        view.write_all(b"persisted").unwrap();
        view.flush().unwrap();
        storage.map(0, 0).unwrap().sync().unwrap();
        storage.close().unwrap();
    }

    let reopened = FileStorage::open(&path, true).unwrap();
    let region = reopened.map(10, 9).unwrap();
    assert_eq!(&*region.bytes().unwrap(), b"persisted");
}

#[test]
fn file_stream_does_not_auto_grow() {
    let dir = tempdir().unwrap();
    let storage = file_with(dir.path(), b"abc");

    let mut view = storage.reader_writer_seeker().unwrap();
    view.seek(SeekFrom::End(0)).unwrap();

    assert!(view.write_all(b"more").is_err());
    assert_eq!(storage.size().unwrap(), 3);
}

#[test]
fn memory_stream_grows_on_write_past_end() {
    let storage = MemoryStorage::with_data(b"abc".to_vec());

    let mut view = storage.reader_writer_seeker().unwrap();
    view.seek(SeekFrom::Start(5)).unwrap();
    view.write_all(b"xyz").unwrap();

    assert_eq!(storage.to_vec().unwrap(), b"abc\0\0xyz");
}

// ============================================================================
// LIFECYCLE AND FACTORIES
// ============================================================================

#[test]
fn close_is_idempotent_and_invalidates_handles() {
    let dir = tempdir().unwrap();
    let data = pattern(256);

    for (name, storage) in backends(dir.path(), &data) {
        let region = storage.map(0, 16).unwrap();

        storage.close().unwrap();
        storage.close().unwrap();

        assert!(storage.is_closed(), "{}", name);
        assert_eq!(error_kind(&region.bytes().unwrap_err()), ErrorKind::StorageClosed, "{}", name);
        assert_eq!(error_kind(&storage.map(0, 1).unwrap_err()), ErrorKind::StorageClosed, "{}", name);
        assert_eq!(error_kind(&storage.size().unwrap_err()), ErrorKind::StorageClosed, "{}", name);
        assert_eq!(error_kind(&storage.grow(1).unwrap_err()), ErrorKind::StorageClosed, "{}", name);
        assert!(storage.reader_writer_seeker().is_err(), "{}", name);
    }
}

#[test]
fn factories_pick_their_backend() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("factory.bin");

    let file = file_factory().open(&path, false).unwrap();
    assert!(file.is_file());
    assert!(path.exists());

    let memory = memory_factory().open(&path, false).unwrap();
    assert!(memory.is_memory());
    assert_eq!(memory.size().unwrap(), 0);

    let boxed = StorageKind::Memory.into_factory();
    assert!(matches!(boxed.open(&path, false).unwrap(), AnyStorage::Memory(_)));
}

#[test]
fn flash_factory_shares_one_image() {
    let flash = flash_factory(vec![0u8; 16], false);

    let writer = flash.open(Path::new("a"), false).unwrap();
    writer.map(0, 4).unwrap().bytes_mut().unwrap().copy_from_slice(b"boot");

    let reader = flash.open(Path::new("b"), true).unwrap();
    assert_eq!(&*reader.map(0, 4).unwrap().bytes().unwrap(), b"boot");

    let mut view = writer.reader_writer_seeker().unwrap();
    view.seek(SeekFrom::Start(14)).unwrap();
    assert!(view.write_all(b"overflow").is_err());
}
