//! Slot I/O over the two store files.
//!
//! A store of capacity `C` keeps `<name>.metadata` (`C × 128` bytes) and
//! `<name>.hd` (`C × (header_len + data_len + pad)` bytes, records padded to
//! a 512-byte multiple for aligned I/O). All reads and writes are positional
//! and cursor-free, so concurrent callers never interfere.
//!
//! Growth preallocates: the header+data file is filled with a fast
//! non-cryptographic pseudorandom stream (reseeded from the store's entropy
//! source every GiB) so the node's disk footprint is identical before and
//! after writes; the metadata file is only ever zero-extended, because an
//! all-zero record is the free-slot encoding and random bytes would read as
//! phantom entries.
//!
//! `offset_ready` is the volatile watermark of the highest slot index known
//! to be backed by both files; callers treat anything above it as absent.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::entry::{Entry, FLAG_OCCUPIED, METADATA_LENGTH};
use crate::error::Result;

/// Header+data records are padded to this alignment.
const HD_ALIGN: usize = 512;

/// Preallocation writes in page-sized chunks.
const FILL_CHUNK: usize = 4096;

/// The fill stream is reseeded from the crypto source this often.
const RESEED_INTERVAL: u64 = 1024 * 1024 * 1024;

pub(crate) struct SlotFiles {
    meta_file: File,
    hd_file: File,
    meta_path: PathBuf,
    hd_path: PathBuf,
    header_len: usize,
    data_len: usize,
    hd_pad: usize,
    /// Highest preallocated slot index, or -1 while unknown (before `start`
    /// or mid-preallocation).
    offset_ready: AtomicI64,
}

impl SlotFiles {
    /// Open or create both store files. Returns `true` in the second slot
    /// iff either file had to be created.
    pub(crate) fn open(
        base_dir: &Path,
        name: &str,
        header_len: usize,
        data_len: usize,
    ) -> Result<(Self, bool)> {
        let meta_path = base_dir.join(format!("{name}.metadata"));
        let hd_path = base_dir.join(format!("{name}.hd"));

        let new_store = !meta_path.exists() || !hd_path.exists();

        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&meta_path)?;
        let hd_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&hd_path)?;

        let hd_pad = (HD_ALIGN - (header_len + data_len) % HD_ALIGN) % HD_ALIGN;

        Ok((
            Self {
                meta_file,
                hd_file,
                meta_path,
                hd_path,
                header_len,
                data_len,
                hd_pad,
                offset_ready: AtomicI64::new(-1),
            },
            new_store,
        ))
    }

    pub(crate) fn hd_stride(&self) -> u64 {
        (self.header_len + self.data_len + self.hd_pad) as u64
    }

    pub(crate) fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub(crate) fn hd_path(&self) -> &Path {
        &self.hd_path
    }

    pub(crate) fn offset_ready(&self) -> i64 {
        self.offset_ready.load(Ordering::Acquire)
    }

    /// Whether a probe may read this slot: true before the watermark is
    /// known, since existing slots are readable while files are re-checked.
    pub(crate) fn readable_at(&self, offset: u64) -> bool {
        let ready = self.offset_ready();
        ready == -1 || (offset as i64) < ready
    }

    /// Whether an insert may claim this slot: strictly below the watermark.
    pub(crate) fn writable_at(&self, offset: u64) -> bool {
        (offset as i64) < self.offset_ready()
    }

    /// Derive the watermark from the actual file lengths.
    pub(crate) fn init_offset_ready(&self) -> Result<()> {
        let meta_len = self.meta_file.metadata()?.len();
        let hd_len = self.hd_file.metadata()?.len();
        let ready = (meta_len / METADATA_LENGTH as u64).min(hd_len / self.hd_stride());
        self.offset_ready.store(ready as i64, Ordering::Release);
        Ok(())
    }

    /// Read the metadata record at `offset`.
    ///
    /// With `expected_key`, a free slot or a digested-key mismatch yields
    /// `None`; a match additionally attaches the (still encrypted)
    /// header+data record when `with_data` is set. Reading past the end of
    /// the file is `Error::Eof`.
    pub(crate) fn read_entry(
        &self,
        offset: u64,
        expected_key: Option<&[u8; 32]>,
        with_data: bool,
    ) -> Result<Option<Entry>> {
        let mut buf = [0u8; METADATA_LENGTH];
        read_exact_at(&self.meta_file, &mut buf, offset * METADATA_LENGTH as u64)?;

        let mut entry = Entry::decode(&buf, offset);

        if let Some(expected) = expected_key {
            if entry.is_free() || entry.digested_routing_key != *expected {
                return Ok(None);
            }
            if with_data {
                let (header, data) = self.read_hd(offset)?;
                entry.set_hd(header, data);
            }
        }

        Ok(Some(entry))
    }

    /// Read the header+data record at `offset`, pad stripped.
    pub(crate) fn read_hd(&self, offset: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut buf = vec![0u8; self.hd_stride() as usize];
        read_exact_at(&self.hd_file, &mut buf, offset * self.hd_stride())?;
        let data = buf[self.header_len..self.header_len + self.data_len].to_vec();
        buf.truncate(self.header_len);
        Ok((buf, data))
    }

    /// Write both records of an entry at `offset`. The entry must already be
    /// ciphertext if it carries header+data.
    pub(crate) fn write_entry(&self, entry: &mut Entry, offset: u64) -> Result<()> {
        debug_assert!(entry.hd.is_none() || entry.encrypted);

        let meta = entry.encode_metadata();
        write_all_at(&self.meta_file, &meta, offset * METADATA_LENGTH as u64)?;

        if let Some(hd) = &entry.hd {
            debug_assert_eq!(hd.header.len(), self.header_len);
            debug_assert_eq!(hd.data.len(), self.data_len);
            let mut buf = vec![0u8; self.hd_stride() as usize];
            buf[..self.header_len].copy_from_slice(&hd.header);
            buf[self.header_len..self.header_len + self.data_len].copy_from_slice(&hd.data);
            write_all_at(&self.hd_file, &buf, offset * self.hd_stride())?;
        }

        entry.cur_offset = Some(offset);
        Ok(())
    }

    /// Read a contiguous run of metadata records into `buf`, returning how
    /// many bytes were actually available (short at end of file).
    pub(crate) fn read_meta_run(&self, first_offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(read_at_most(
            &self.meta_file,
            buf,
            first_offset * METADATA_LENGTH as u64,
        )?)
    }

    /// Write a contiguous run of metadata records back.
    pub(crate) fn write_meta_run(&self, first_offset: u64, buf: &[u8]) -> Result<()> {
        write_all_at(&self.meta_file, buf, first_offset * METADATA_LENGTH as u64)
    }

    pub(crate) fn flags_at(&self, offset: u64) -> Result<u64> {
        let entry = self.read_entry(offset, None, false)?;
        Ok(entry.map(|entry| entry.flags).unwrap_or(0))
    }

    pub(crate) fn is_free_at(&self, offset: u64) -> Result<bool> {
        Ok(self.flags_at(offset)? & FLAG_OCCUPIED == 0)
    }

    pub(crate) fn digested_key_at(&self, offset: u64) -> Result<[u8; 32]> {
        let entry = self.read_entry(offset, None, false)?;
        Ok(entry
            .map(|entry| entry.digested_routing_key)
            .unwrap_or([0u8; 32]))
    }

    /// Resize both files to hold `store_max` slots, preallocating the growth
    /// when asked. Shrinks truncate. The watermark is -1 for the duration of
    /// a fill and tracks completed slots as it proceeds.
    pub(crate) fn set_store_file_size(
        &self,
        store_max: u64,
        preallocate: bool,
        seed_source: &mut dyn RngCore,
    ) -> Result<()> {
        let meta_len = self.meta_file.metadata()?.len();
        let hd_len = self.hd_file.metadata()?.len();

        let new_meta_len = METADATA_LENGTH as u64 * store_max;
        let new_hd_len = self.hd_stride() * store_max;

        if preallocate && (meta_len < new_meta_len || hd_len < new_hd_len) {
            self.offset_ready.store(-1, Ordering::Release);

            // set_len zero-extends, which is exactly the free-slot encoding.
            // Extend the metadata first so every slot the watermark admits
            // below is fully backed.
            self.meta_file
                .set_len(new_meta_len.max(meta_len))?;

            // Fill the header+data growth with pseudorandom bytes, starting
            // from the next page boundary; set_len below trims any overshoot.
            let mut pos = hd_len.next_multiple_of(FILL_CHUNK as u64);
            let mut chunk = [0u8; FILL_CHUNK];
            let mut fill = reseed(seed_source);
            while pos < new_hd_len {
                fill.fill_bytes(&mut chunk);
                write_all_at(&self.hd_file, &chunk, pos)?;
                pos += FILL_CHUNK as u64;
                if pos % RESEED_INTERVAL == 0 {
                    fill = reseed(seed_source);
                    tracing::info!(
                        filled = pos,
                        target = new_hd_len,
                        path = %self.hd_path.display(),
                        "preallocating store file"
                    );
                }
                self.offset_ready
                    .store((pos / self.hd_stride()) as i64, Ordering::Release);
            }
        }

        self.meta_file.set_len(new_meta_len)?;
        self.hd_file.set_len(new_hd_len)?;
        self.offset_ready.store(store_max as i64, Ordering::Release);
        Ok(())
    }

    pub(crate) fn lengths(&self) -> Result<(u64, u64)> {
        let meta_len = self.meta_file.metadata()?.len();
        let hd_len = self.hd_file.metadata()?.len();
        Ok((meta_len, hd_len))
    }

    pub(crate) fn force(&self) -> Result<()> {
        self.meta_file.sync_all()?;
        self.hd_file.sync_all()?;
        Ok(())
    }
}

fn reseed(seed_source: &mut dyn RngCore) -> ChaCha8Rng {
    let mut seed = [0u8; 32];
    seed_source.fill_bytes(&mut seed);
    ChaCha8Rng::from_seed(seed)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset).map_err(Into::into)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset).map_err(Into::into)
}

#[cfg(unix)]
fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        match file.read_at(&mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(read)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(crate::error::Error::Eof),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(crate::error::Error::IO("write returned 0".into())),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        match file.seek_read(&mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tmpfs::TempDir;
    use rand::rngs::StdRng;

    const HEADER_LEN: usize = 36;
    const DATA_LEN: usize = 1024;

    fn files(dir: &TempDir) -> SlotFiles {
        let (files, new_store) = SlotFiles::open(dir.path(), "test", HEADER_LEN, DATA_LEN).unwrap();
        assert!(new_store);
        files
    }

    #[test]
    fn test_padding_to_alignment() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir);
        assert_eq!(files.hd_stride(), 1536);
        assert_eq!(files.hd_stride() % HD_ALIGN as u64, 0);

        let (exact, _) = SlotFiles::open(dir.path(), "exact", 512, 512).unwrap();
        assert_eq!(exact.hd_stride(), 1024);
    }

    #[test]
    fn test_preallocation_sizes_and_content() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir);
        let mut rng = StdRng::seed_from_u64(1);
        files.set_store_file_size(64, true, &mut rng).unwrap();

        let (meta_len, hd_len) = files.lengths().unwrap();
        assert_eq!(meta_len, 64 * METADATA_LENGTH as u64);
        assert_eq!(hd_len, 64 * files.hd_stride());
        assert_eq!(files.offset_ready(), 64);

        // Every preallocated metadata slot must read as free.
        for offset in 0..64 {
            assert!(files.is_free_at(offset).unwrap());
        }

        // The hd fill is pseudorandom, not zeros.
        let (header, data) = files.read_hd(10).unwrap();
        assert!(header.iter().chain(data.iter()).any(|&b| b != 0));
    }

    #[test]
    fn test_shrink_truncates() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir);
        let mut rng = StdRng::seed_from_u64(2);
        files.set_store_file_size(64, true, &mut rng).unwrap();
        files.set_store_file_size(16, true, &mut rng).unwrap();

        let (meta_len, hd_len) = files.lengths().unwrap();
        assert_eq!(meta_len, 16 * METADATA_LENGTH as u64);
        assert_eq!(hd_len, 16 * files.hd_stride());
        assert!(matches!(files.read_entry(20, None, false), Err(Error::Eof)));
    }

    #[test]
    fn test_entry_round_trip() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir);
        let mut rng = StdRng::seed_from_u64(3);
        files.set_store_file_size(32, true, &mut rng).unwrap();

        let digested = [0xCD; 32];
        let mut entry = Entry::new(
            [0xAB; 32],
            digested,
            &[1u8; HEADER_LEN],
            &[2u8; DATA_LEN],
            true,
            false,
            32,
            1,
        );
        // The files layer stores whatever bytes it is given; mark the entry
        // as ciphertext without running the cipher.
        entry.encrypted = true;
        files.write_entry(&mut entry, 5).unwrap();
        assert_eq!(entry.cur_offset, Some(5));

        let read = files.read_entry(5, Some(&digested), true).unwrap().unwrap();
        assert_eq!(read.digested_routing_key, digested);
        assert_eq!(read.store_size, 32);
        let hd = read.hd.unwrap();
        assert_eq!(hd.header, vec![1u8; HEADER_LEN]);
        assert_eq!(hd.data, vec![2u8; DATA_LEN]);

        // A different expected key reads as not-found.
        assert!(files
            .read_entry(5, Some(&[0x11; 32]), false)
            .unwrap()
            .is_none());
        // Free slots read as not-found too.
        assert!(files
            .read_entry(6, Some(&digested), false)
            .unwrap()
            .is_none());
        assert!(!files.is_free_at(5).unwrap());
    }

    #[test]
    fn test_watermark_gating() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir);

        // Unknown watermark: reads allowed, writes denied.
        assert!(files.readable_at(1000));
        assert!(!files.writable_at(0));

        let mut rng = StdRng::seed_from_u64(4);
        files.set_store_file_size(8, true, &mut rng).unwrap();
        assert!(files.writable_at(7));
        assert!(!files.writable_at(8));
        assert!(!files.readable_at(8));
    }

    #[test]
    fn test_meta_run_short_read() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir);
        let mut rng = StdRng::seed_from_u64(5);
        files.set_store_file_size(10, true, &mut rng).unwrap();

        let mut buf = vec![0u8; 4 * METADATA_LENGTH];
        assert_eq!(files.read_meta_run(8, &mut buf).unwrap(), 2 * METADATA_LENGTH);
    }
}
