//! File-backed bloom filter guarding the store against pointless disk probes.
//!
//! The filter is sized independently of store capacity and lives in memory,
//! persisted to `<name>.bloom` on [`BloomFilter::force`]. Two cell layouts:
//! a plain bitmap (one bit per cell, no removal) and a counting layout (one
//! saturating byte per cell, so overwritten keys can be removed).
//!
//! During maintenance the filter is *forked*: a zeroed write-only shadow
//! accumulates the keys the sweep re-discovers while the live filter keeps
//! answering queries. On success the shadow atomically replaces the live
//! cells ([`merge`](BloomFilter::merge)); on abort it is discarded. Live
//! `add`s during a fork are mirrored into the shadow so foreground inserts
//! survive the merge; `remove` touches only the live cells — the shadow
//! stays add-only.
//!
//! Cell indexes are derived from the 32-byte digested key by double hashing,
//! so no extra hash runs on the hot path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;

struct Fork {
    k: u32,
    cells: Vec<u8>,
}

struct Inner {
    k: u32,
    cells: Vec<u8>,
    fork: Option<Fork>,
    dirty: bool,
}

pub(crate) struct BloomFilter {
    path: PathBuf,
    /// Number of cells. Rounded up to a whole byte of bitmap.
    size_bits: u64,
    counting: bool,
    needs_rebuild: bool,
    inner: Mutex<Inner>,
}

impl BloomFilter {
    /// Open or create the filter file. A missing file or one whose length no
    /// longer matches the configured size yields a zeroed filter flagged as
    /// needing a rebuild.
    pub(crate) fn open(
        path: &Path,
        size_bits: u64,
        k: u32,
        counting: bool,
    ) -> std::io::Result<Self> {
        let size_bits = (size_bits + 7) / 8 * 8;
        let byte_len = cell_bytes(size_bits, counting);

        let (cells, needs_rebuild) = match fs::read(path) {
            Ok(bytes) if bytes.len() as u64 == byte_len => (bytes, false),
            Ok(_) => (vec![0u8; byte_len as usize], true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (vec![0u8; byte_len as usize], true)
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            path: path.to_path_buf(),
            size_bits,
            counting,
            needs_rebuild,
            inner: Mutex::new(Inner {
                k: k.max(1),
                cells,
                fork: None,
                dirty: false,
            }),
        })
    }

    /// Whether the on-disk filter was missing or mis-sized at open.
    pub(crate) fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// `k` that minimizes the false-positive rate for `size_bits` cells
    /// holding `max_keys` keys.
    pub(crate) fn optimal_k(size_bits: u64, max_keys: u64) -> u32 {
        if size_bits == 0 || max_keys == 0 {
            return 1;
        }
        let k = (size_bits as f64 / max_keys as f64 * std::f64::consts::LN_2).round();
        (k as u32).clamp(1, 32)
    }

    pub(crate) fn add(&self, digested_key: &[u8; 32]) {
        if self.size_bits == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let k = inner.k;
        for cell in cell_indexes(digested_key, k, self.size_bits) {
            bump(&mut inner.cells, cell, self.counting);
        }
        if let Some(fork) = inner.fork.as_mut() {
            for cell in cell_indexes(digested_key, fork.k, self.size_bits) {
                bump(&mut fork.cells, cell, self.counting);
            }
        }
        inner.dirty = true;
    }

    /// Add to the forked shadow only. Called by maintenance for entries it
    /// has re-discovered on disk.
    pub(crate) fn add_forked(&self, digested_key: &[u8; 32]) {
        if self.size_bits == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(fork) = inner.fork.as_mut() {
            for cell in cell_indexes(digested_key, fork.k, self.size_bits) {
                bump(&mut fork.cells, cell, self.counting);
            }
        }
    }

    /// Remove a key. Only effective on the counting layout; a plain bitmap
    /// keeps the bits (and accrues false positives until the next rebuild).
    pub(crate) fn remove(&self, digested_key: &[u8; 32]) {
        if self.size_bits == 0 || !self.counting {
            return;
        }
        let mut inner = self.inner.lock();
        let k = inner.k;
        for cell in cell_indexes(digested_key, k, self.size_bits) {
            let count = &mut inner.cells[cell as usize];
            // A saturated counter has lost its true count and can never be
            // decremented again.
            if *count != 0 && *count != u8::MAX {
                *count -= 1;
            }
        }
        inner.dirty = true;
    }

    pub(crate) fn test(&self, digested_key: &[u8; 32]) -> bool {
        if self.size_bits == 0 {
            return true;
        }
        let inner = self.inner.lock();
        cell_indexes(digested_key, inner.k, self.size_bits)
            .all(|cell| cell_set(&inner.cells, cell, self.counting))
    }

    /// Start a write-only shadow with the given hash-function count.
    pub(crate) fn fork(&self, k: u32) {
        let mut inner = self.inner.lock();
        let byte_len = cell_bytes(self.size_bits, self.counting) as usize;
        inner.fork = Some(Fork {
            k: k.max(1),
            cells: vec![0u8; byte_len],
        });
    }

    /// Replace the live cells with the forked shadow.
    pub(crate) fn merge(&self) {
        let mut inner = self.inner.lock();
        if let Some(fork) = inner.fork.take() {
            inner.cells = fork.cells;
            inner.k = fork.k;
            inner.dirty = true;
        }
    }

    /// Throw the forked shadow away, keeping the live filter untouched.
    pub(crate) fn discard(&self) {
        self.inner.lock().fork = None;
    }

    /// Persist the live cells if they changed since the last force.
    pub(crate) fn force(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Ok(());
        }
        let mut file = fs::File::create(&self.path)?;
        file.write_all(&inner.cells)?;
        file.sync_all()?;
        inner.dirty = false;
        Ok(())
    }
}

fn cell_bytes(size_bits: u64, counting: bool) -> u64 {
    if counting {
        size_bits
    } else {
        size_bits / 8
    }
}

fn bump(cells: &mut [u8], cell: u64, counting: bool) {
    if counting {
        let count = &mut cells[cell as usize];
        *count = count.saturating_add(1);
    } else {
        cells[(cell / 8) as usize] |= 1 << (cell & 7);
    }
}

fn cell_set(cells: &[u8], cell: u64, counting: bool) -> bool {
    if counting {
        cells[cell as usize] != 0
    } else {
        cells[(cell / 8) as usize] & (1 << (cell & 7)) != 0
    }
}

fn cell_indexes(digested_key: &[u8; 32], k: u32, size_bits: u64) -> impl Iterator<Item = u64> {
    let h1 = BigEndian::read_u64(&digested_key[0..8]);
    let h2 = BigEndian::read_u64(&digested_key[8..16]);
    (0..k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % size_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn digest(tag: u8) -> [u8; 32] {
        let mut digest = [tag; 32];
        digest[0] = tag.wrapping_mul(37);
        digest[8] = tag.wrapping_mul(101) | 1;
        digest
    }

    #[test]
    fn test_no_false_negatives() {
        let dir = TempDir::new().unwrap();
        let filter = BloomFilter::open(&dir.path().join("t.bloom"), 1024, 4, false).unwrap();
        for tag in 0..100 {
            filter.add(&digest(tag));
        }
        for tag in 0..100 {
            assert!(filter.test(&digest(tag)));
        }
    }

    #[test]
    fn test_counting_remove() {
        let dir = TempDir::new().unwrap();
        let filter = BloomFilter::open(&dir.path().join("t.bloom"), 4096, 4, true).unwrap();
        filter.add(&digest(1));
        filter.add(&digest(2));
        assert!(filter.test(&digest(1)));
        filter.remove(&digest(1));
        assert!(!filter.test(&digest(1)));
        assert!(filter.test(&digest(2)));
    }

    #[test]
    fn test_fork_merge_discard() {
        let dir = TempDir::new().unwrap();
        let filter = BloomFilter::open(&dir.path().join("t.bloom"), 2048, 4, true).unwrap();
        filter.add(&digest(1));

        filter.fork(3);
        filter.add_forked(&digest(2));
        // Live adds during a fork land in both.
        filter.add(&digest(3));
        assert!(filter.test(&digest(1)));
        assert!(!filter.test(&digest(2)));

        filter.merge();
        assert!(filter.test(&digest(2)));
        assert!(filter.test(&digest(3)));
        // digest(1) was never re-added to the shadow, so the merge drops it.
        assert!(!filter.test(&digest(1)));

        filter.fork(3);
        filter.add_forked(&digest(9));
        filter.discard();
        assert!(!filter.test(&digest(9)));
        assert!(filter.test(&digest(2)));
    }

    #[test]
    fn test_persistence_and_rebuild_detection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bloom");

        let filter = BloomFilter::open(&path, 1024, 4, false).unwrap();
        assert!(filter.needs_rebuild());
        filter.add(&digest(42));
        filter.force().unwrap();

        let reopened = BloomFilter::open(&path, 1024, 4, false).unwrap();
        assert!(!reopened.needs_rebuild());
        assert!(reopened.test(&digest(42)));

        // A size change invalidates the persisted cells.
        let resized = BloomFilter::open(&path, 2048, 4, false).unwrap();
        assert!(resized.needs_rebuild());
    }

    #[test]
    fn test_optimal_k() {
        assert_eq!(BloomFilter::optimal_k(0, 100), 1);
        assert_eq!(BloomFilter::optimal_k(100, 0), 1);
        // m/n = 8 => k = round(8 ln 2) = 6
        assert_eq!(BloomFilter::optimal_k(8192, 1024), 6);
        assert_eq!(BloomFilter::optimal_k(1, 1_000_000), 1);
    }
}
