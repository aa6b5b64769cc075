//! C4: the file-system layout. Key → (slot, bucket) mapping and the
//! traversal algorithm that finds buckets within a key range.
//!
//! Pure functions over a [`FileSystem`] capability, mirroring the
//! production/test-fake split in `vector_buffers::variants::disk_v2::io`'s
//! `Filesystem` trait, and the glob-based directory discovery style of
//! `file_source::paths_provider::glob`. Unlike the reader/writer I/O paths,
//! directory scans are not suspension points (spec.md §5), so this module is
//! entirely synchronous.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::LayoutError;
use crate::record::LEGACY_RECORD_HEADER_LEN;

/// Minimum file size for a bucket file to be considered present; anything
/// smaller is treated as if the file did not exist (spec.md §4.4).
const MIN_BUCKET_FILE_SIZE: u64 = LEGACY_RECORD_HEADER_LEN as u64;

pub const MAX_BUCKET_ID: u64 = 0xFFF;
pub const MAX_SLOT_ID: u64 = 0xFF_FFFF_FFFF;

/// Abstraction over directory listing and file stat, so the scan algorithm
/// can run against a real directory tree or an in-memory test fake.
pub trait FileSystem {
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>>;
    /// `Ok(None)` if the path does not exist.
    fn file_len(&self, path: &Path) -> std::io::Result<Option<u64>>;
    fn remove_file(&self, path: &Path) -> std::io::Result<()>;
    fn remove_dir(&self, path: &Path) -> std::io::Result<()>;
}

/// A [`FileSystem`] backed by real directory entries on disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        match fs::read_dir(path) {
            Ok(entries) => entries
                .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn file_len(&self, path: &Path) -> std::io::Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Splits a key into `(slot, bucket)` per spec.md §3.
pub fn slot_bucket_of(key: u64) -> (u64, u64) {
    let slot = key >> 24;
    let bucket = (key >> 12) & MAX_BUCKET_ID;
    (slot, bucket)
}

/// The first theoretical key stored in `(slot, bucket)`.
pub fn first_key_of(slot: u64, bucket: u64) -> u64 {
    (slot << 24) | (bucket << 12)
}

pub fn slot_dir_name(slot: u64) -> String {
    format!("{:010x}", slot)
}

pub fn bucket_file_name(bucket: u64) -> String {
    format!("{:03x}", bucket)
}

fn parse_hex(name: &str, digits: usize) -> Option<u64> {
    if name.len() != digits || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// A bucket found by a range scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundBucket {
    pub slot: u64,
    pub bucket: u64,
    pub path: PathBuf,
}

impl FoundBucket {
    pub fn first_key(&self) -> u64 {
        first_key_of(self.slot, self.bucket)
    }
}

/// Lists slot directory names under `base`, parsed as hex, sorted
/// ascending, and restricted to `[min_slot, max_slot]`.
fn candidate_slots<FS: FileSystem>(
    fs: &FS,
    base: &Path,
    min_slot: u64,
    max_slot: u64,
) -> Result<Vec<u64>, LayoutError> {
    let mut slots: Vec<u64> = fs
        .list_dir(base)?
        .into_iter()
        .filter_map(|name| match parse_hex(&name, 10) {
            Some(slot) => Some(slot),
            None => {
                warn!(entry = %name, "non-hex entry under channel directory, skipping");
                None
            }
        })
        .filter(|&slot| slot >= min_slot && slot <= max_slot)
        .collect();
    slots.sort_unstable();
    slots.dedup();
    Ok(slots)
}

/// Scans a single slot directory for the lowest existing, non-empty bucket
/// file whose id lies in `[lo_bucket, hi_bucket]`, `stat`-ing consecutive
/// candidate names rather than listing and sorting the directory.
fn scan_slot_for_bucket<FS: FileSystem>(
    fs: &FS,
    base: &Path,
    slot: u64,
    lo_bucket: u64,
    hi_bucket: u64,
) -> Result<Option<FoundBucket>, LayoutError> {
    let slot_dir = base.join(slot_dir_name(slot));
    let mut bucket = lo_bucket;
    while bucket <= hi_bucket {
        let path = slot_dir.join(bucket_file_name(bucket));
        if let Some(len) = fs.file_len(&path)? {
            if len >= MIN_BUCKET_FILE_SIZE {
                return Ok(Some(FoundBucket { slot, bucket, path }));
            }
        }
        if bucket == MAX_BUCKET_ID {
            break;
        }
        bucket += 1;
    }
    Ok(None)
}

/// Core two-level search shared by `get_first_bucket_in_range` and
/// `get_next_bucket`: walk candidate slot directories ascending, and within
/// each, scan for the lowest in-range bucket file that actually exists.
fn get_first_bucket_(
    fs: &impl FileSystem,
    base: &Path,
    min_slot: u64,
    min_bucket: u64,
    max_slot: u64,
    max_bucket: u64,
) -> Result<Option<FoundBucket>, LayoutError> {
    if min_slot > max_slot || (min_slot == max_slot && min_bucket > max_bucket) {
        return Ok(None);
    }

    for slot in candidate_slots(fs, base, min_slot, max_slot)? {
        let lo = if slot == min_slot { min_bucket } else { 0 };
        let hi = if slot == max_slot { max_bucket } else { MAX_BUCKET_ID };
        if let Some(found) = scan_slot_for_bucket(fs, base, slot, lo, hi)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Finds the first bucket file whose id lies within `[min_hash, max_hash]`.
pub fn get_first_bucket_in_range(
    fs: &impl FileSystem,
    base: &Path,
    min_hash: u64,
    max_hash: u64,
) -> Result<Option<FoundBucket>, LayoutError> {
    let (min_slot, min_bucket) = slot_bucket_of(min_hash);
    let (max_slot, max_bucket) = slot_bucket_of(max_hash);
    get_first_bucket_(fs, base, min_slot, min_bucket, max_slot, max_bucket)
}

/// Finds the next bucket strictly after the one containing `last_hash`,
/// within `[.., max_hash]`.
pub fn get_next_bucket(
    fs: &impl FileSystem,
    base: &Path,
    last_hash: u64,
    max_hash: u64,
) -> Result<Option<FoundBucket>, LayoutError> {
    let (last_slot, last_bucket) = slot_bucket_of(last_hash);
    let (max_slot, max_bucket) = slot_bucket_of(max_hash);

    let (next_slot, next_bucket) = if last_bucket == MAX_BUCKET_ID {
        (last_slot + 1, 0)
    } else {
        (last_slot, last_bucket + 1)
    };

    match next_slot.cmp(&max_slot) {
        Ordering::Greater => Ok(None),
        _ => get_first_bucket_(fs, base, next_slot, next_bucket, max_slot, max_bucket),
    }
}

/// Removes every bucket file and slot directory under `base`, per the
/// channel-remove lifecycle (spec.md §3).
pub fn remove_files(fs: &impl FileSystem, base: &Path) -> Result<(), LayoutError> {
    for name in fs.list_dir(base)? {
        let Some(slot) = parse_hex(&name, 10) else {
            warn!(entry = %name, "non-hex entry under channel directory during removal, skipping");
            continue;
        };
        let slot_dir = base.join(slot_dir_name(slot));
        for bucket_name in fs.list_dir(&slot_dir)? {
            if parse_hex(&bucket_name, 3).is_none() {
                warn!(entry = %bucket_name, "non-hex bucket entry during removal, skipping");
                continue;
            }
            fs.remove_file(&slot_dir.join(&bucket_name))?;
        }
        fs.remove_dir(&slot_dir)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_fs::FakeFileSystem;
    use super::*;

    fn touch_bucket(fs: &FakeFileSystem, base: &Path, slot: u64, bucket: u64, len: u64) {
        let path = base.join(slot_dir_name(slot)).join(bucket_file_name(bucket));
        fs.touch(&path, len);
    }

    #[test]
    fn slot_bucket_decomposition_round_trips() {
        let key = 0x570e13eb00000001u64;
        let (slot, bucket) = slot_bucket_of(key);
        assert!(first_key_of(slot, bucket) <= key);
        assert!(key - first_key_of(slot, bucket) < 4096);
    }

    #[test]
    fn finds_bucket_containing_min_hash() {
        let base = PathBuf::from("/data/c1");
        let fs = FakeFileSystem::new();
        touch_bucket(&fs, &base, 0, 0, 64);
        touch_bucket(&fs, &base, 0, 1, 64);
        touch_bucket(&fs, &base, 0, 0xfff, 64);

        let found = get_first_bucket_in_range(&fs, &base, 0x1, 0x1fff)
            .unwrap()
            .unwrap();
        assert_eq!(found.bucket, 0);

        let found = get_first_bucket_in_range(&fs, &base, 0x1000, 0x1fff)
            .unwrap()
            .unwrap();
        assert_eq!(found.bucket, 1);
    }

    #[test]
    fn get_next_bucket_is_strictly_monotone() {
        let base = PathBuf::from("/data/t");
        let fs = FakeFileSystem::new();
        touch_bucket(&fs, &base, 0, 0, 64);
        touch_bucket(&fs, &base, 0, 1, 64);
        touch_bucket(&fs, &base, 0, 0xfff, 64);

        let last = first_key_of(0, 1);
        let next = get_next_bucket(&fs, &base, last, u64::MAX).unwrap().unwrap();
        assert_eq!(next.bucket, 0xfff);

        let last = first_key_of(0, 0xfff);
        let end = get_next_bucket(&fs, &base, last, first_key_of(0, 0xfff));
        assert_eq!(end.unwrap(), None);
    }

    #[test]
    fn next_bucket_crosses_slot_boundary() {
        let base = PathBuf::from("/data/s");
        let fs = FakeFileSystem::new();
        touch_bucket(&fs, &base, 0, 0xfff, 64);
        touch_bucket(&fs, &base, 1, 0, 64);

        let last = first_key_of(0, 0xfff);
        let next = get_next_bucket(&fs, &base, last, u64::MAX).unwrap().unwrap();
        assert_eq!(next.slot, 1);
        assert_eq!(next.bucket, 0);
    }

    #[test]
    fn undersized_bucket_file_is_ignored() {
        let base = PathBuf::from("/data/u");
        let fs = FakeFileSystem::new();
        touch_bucket(&fs, &base, 0, 0, 4); // below header size
        touch_bucket(&fs, &base, 0, 1, 64);

        let found = get_first_bucket_in_range(&fs, &base, 0, 0xffff).unwrap().unwrap();
        assert_eq!(found.bucket, 1);
    }

    #[test]
    fn no_bucket_in_range_returns_none() {
        let base = PathBuf::from("/data/empty");
        let fs = FakeFileSystem::new();
        let found = get_first_bucket_in_range(&fs, &base, 0, 0xffff).unwrap();
        assert_eq!(found, None);
    }
}
