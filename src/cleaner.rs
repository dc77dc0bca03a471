//! Background maintenance: capacity migration and bloom-filter rebuild.
//!
//! One low-priority thread per store wakes every few minutes (or when
//! signalled) and, if there is work, takes the process-wide maintenance
//! latch so at most one store does heavy batch I/O at a time.
//!
//! Both jobs run through the same batch framework: walk the slot space in
//! 128-slot batches, lock each batch's offsets in ascending order, read its
//! metadata as one buffer, transform each occupied entry, and write the
//! buffer back only if something changed. Shutdown aborts between batches;
//! an abort discards the forked bloom filter and leaves the persisted state
//! (`prev_store_size`, flags) untouched so the next sweep resumes.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use crate::block::BlockAdapter;
use crate::bloom::BloomFilter;
use crate::config::CleanerOptions;
use crate::entry::{Entry, METADATA_LENGTH};
use crate::error::Result;
use crate::layout::candidate_offsets;
use crate::locks::try_maintenance_latch;
use crate::store::{CleanerSignal, SaltedHashStore, FLAG_REBUILD_BLOOM};

/// Slots processed per locked batch, and the bound of the relocation queue.
pub(crate) const BATCH_SIZE: u64 = 128;

/// The bloom filter is forced to disk every this many sweeps.
const BLOOM_FORCE_SWEEPS: u64 = 6;

/// The config record is persisted every this many batches of a job.
const CONFIG_WRITE_BATCHES: u64 = 16;

const PROGRESS_LOG_BATCHES: u64 = 64;

pub(crate) fn spawn<A: BlockAdapter>(
    store: Weak<SaltedHashStore<A>>,
    name: String,
    options: CleanerOptions,
    signal: Arc<CleanerSignal>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("salthash-cleaner-{name}"))
        .spawn(move || run(store, options, signal))
}

fn run<A: BlockAdapter>(
    store: Weak<SaltedHashStore<A>>,
    options: CleanerOptions,
    signal: Arc<CleanerSignal>,
) {
    // Stagger the first sweep so stores opened together don't all hit the
    // disk at once. A resize request still wakes us early.
    let first_wait = if options.jitter {
        options.period / 2 + options.period.mul_f64(rand::thread_rng().gen::<f64>())
    } else {
        options.period
    };
    signal.wait(first_wait);

    let mut sweeps = 0u64;
    loop {
        let store = match store.upgrade() {
            Some(store) => store,
            None => return,
        };
        if store.shutdown.load(Ordering::SeqCst) {
            return;
        }
        sweeps += 1;
        sweep(&store, &options, sweeps);
        drop(store);

        signal.wait(options.period);
    }
}

fn sweep<A: BlockAdapter>(store: &SaltedHashStore<A>, options: &CleanerOptions, sweeps: u64) {
    let prev_store_size = store.config.read().prev_store_size;
    if prev_store_size != 0 {
        if let Some(_latch) = try_maintenance_latch() {
            resize_store(store, prev_store_size, Some(options.batch_sleep));
        }
    }

    let rebuild = {
        let config = store.config.read();
        config.flags & FLAG_REBUILD_BLOOM != 0 && config.prev_store_size == 0
    };
    if rebuild {
        if let Some(_latch) = try_maintenance_latch() {
            rebuild_bloom(store);
        }
    }

    if sweeps % BLOOM_FORCE_SWEEPS == 0 {
        if let Err(err) = store.bloom.force() {
            tracing::error!(store = %store.name(), error = %err, "can't force bloom filter");
        }
    }
    store.persist_config_now();
}

/// What to do with one occupied entry.
enum Outcome {
    /// Leave the slot untouched.
    Keep,
    /// Write the (metadata-only) entry back in place.
    Rewrite(Entry),
    /// Clear the slot.
    Free,
}

trait BatchProcessor {
    fn init(&mut self) -> Result<()>;

    /// Transform one occupied entry. Free slots are skipped before this.
    fn process(&mut self, entry: Entry) -> Outcome;

    /// Called after each batch, outside the slot locks. `false` aborts the
    /// walk (the job's premise no longer holds).
    fn batch(&mut self, entries_left: u64) -> bool;

    fn abort(&mut self);

    fn finish(&mut self);
}

/// Migrate entries across a capacity change, walking the old slot space.
pub(crate) fn resize_store<A: BlockAdapter>(
    store: &SaltedHashStore<A>,
    prev_store_size: u64,
    sleep: Option<Duration>,
) {
    let store_size = store.config.read().store_size;
    tracing::info!(
        store = %store.name(),
        from = prev_store_size,
        to = store_size,
        "starting store resize"
    );

    // Shrinks walk down from the old high-water so the files can be
    // truncated behind the walk; grows walk up.
    let reverse = store_size < prev_store_size;
    let mut processor = ResizeProcessor {
        store,
        prev_store_size,
        store_size,
        generation: 0,
        optimal_k: 0,
        queue: VecDeque::new(),
        batches: 0,
    };
    batch_walk(store, &mut processor, prev_store_size, reverse, sleep);
}

/// Repopulate the bloom filter from the slots actually on disk.
pub(crate) fn rebuild_bloom<A: BlockAdapter>(store: &SaltedHashStore<A>) {
    let store_size = store.config.read().store_size;
    tracing::info!(store = %store.name(), "start rebuilding bloom filter");

    let mut processor = RebuildProcessor {
        store,
        generation: 0,
        optimal_k: 0,
        batches: 0,
    };
    batch_walk(store, &mut processor, store_size, false, None);
}

fn batch_walk<A: BlockAdapter, P: BatchProcessor>(
    store: &SaltedHashStore<A>,
    processor: &mut P,
    walk_size: u64,
    reverse: bool,
    sleep: Option<Duration>,
) {
    store.progress.start(walk_size);

    if let Err(err) = processor.init() {
        tracing::error!(store = %store.name(), error = %err, "maintenance init failed");
        processor.abort();
        store.progress.clear();
        return;
    }

    let step: i64 = if reverse {
        -(BATCH_SIZE as i64)
    } else {
        BATCH_SIZE as i64
    };
    let mut cur: i64 = if reverse {
        (((walk_size - 1) / BATCH_SIZE) * BATCH_SIZE) as i64
    } else {
        0
    };

    let mut batch_index = 0u64;
    while cur >= 0 && (cur as u64) < walk_size {
        if store.shutdown.load(Ordering::SeqCst) {
            processor.abort();
            store.progress.clear();
            return;
        }

        if batch_index % PROGRESS_LOG_BATCHES == 0 {
            tracing::info!(
                store = %store.name(),
                processed = batch_index * BATCH_SIZE,
                total = walk_size,
                "cleaner in progress"
            );
        }
        batch_index += 1;

        match process_batch(store, processor, cur as u64, BATCH_SIZE) {
            Ok(true) => {}
            // Slot locks denied: shutdown won the race.
            Ok(false) => {
                processor.abort();
                store.progress.clear();
                return;
            }
            Err(err) => {
                tracing::error!(
                    store = %store.name(),
                    offset = cur,
                    error = %err,
                    "maintenance batch failed"
                );
                processor.abort();
                store.progress.clear();
                return;
            }
        }

        let entries_left = if reverse {
            cur as u64
        } else {
            walk_size.saturating_sub(cur as u64 + BATCH_SIZE)
        };
        store.progress.update(walk_size - entries_left);

        if !processor.batch(entries_left) {
            processor.abort();
            store.progress.clear();
            return;
        }

        if let Some(sleep) = sleep {
            thread::sleep(sleep);
        }
        cur += step;
    }

    processor.finish();
    store.progress.clear();
}

/// Lock one batch of slots, run the processor over its occupied entries,
/// and write the metadata buffer back if anything changed. `Ok(false)`
/// means the locks were denied (shutdown).
fn process_batch<A: BlockAdapter, P: BatchProcessor>(
    store: &SaltedHashStore<A>,
    processor: &mut P,
    first_offset: u64,
    length: u64,
) -> Result<bool> {
    let _guard = match store.locks.lock_all(first_offset..first_offset + length) {
        Some(guard) => guard,
        None => return Ok(false),
    };

    let mut buf = vec![0u8; length as usize * METADATA_LENGTH];
    let available = store.files.read_meta_run(first_offset, &mut buf)?;
    let slots = available / METADATA_LENGTH;

    let mut dirty = false;
    for j in 0..slots {
        if store.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let record = j * METADATA_LENGTH;
        let entry = Entry::decode(&buf[record..record + METADATA_LENGTH], first_offset + j as u64);
        if entry.is_free() {
            continue;
        }
        match processor.process(entry) {
            Outcome::Keep => {}
            Outcome::Free => {
                buf[record..record + METADATA_LENGTH].fill(0);
                store.stats.decrement_key_count();
                dirty = true;
            }
            Outcome::Rewrite(rewritten) => {
                debug_assert!(rewritten.hd.is_none());
                buf[record..record + METADATA_LENGTH].copy_from_slice(&rewritten.encode_metadata());
                dirty = true;
            }
        }
    }

    if dirty {
        store.files.write_meta_run(first_offset, &buf[..available])?;
    }
    Ok(true)
}

struct ResizeProcessor<'a, A: BlockAdapter> {
    store: &'a SaltedHashStore<A>,
    prev_store_size: u64,
    store_size: u64,
    generation: u32,
    optimal_k: u32,
    /// Entries pulled out of stale buckets, waiting for a slot in the new
    /// capacity. Bounded: on overflow the oldest is dropped — the store is
    /// content-addressed, so a lost entry is recoverable from the network.
    queue: VecDeque<Entry>,
    batches: u64,
}

impl<A: BlockAdapter> BatchProcessor for ResizeProcessor<'_, A> {
    fn init(&mut self) -> Result<()> {
        if self.store_size > self.prev_store_size {
            let mut rng = self.store.rng.lock();
            self.store.files.set_store_file_size(
                self.store_size,
                self.store.options.preallocate,
                &mut **rng,
            )?;
        }
        self.optimal_k =
            BloomFilter::optimal_k(self.store.options.bloom_filter_size, self.store_size);

        let mut config = self.store.config.write();
        config.generation = config.generation.wrapping_add(1);
        self.generation = config.generation;
        self.store.bloom.fork(self.optimal_k);
        // The walk re-counts every entry it keeps or relocates.
        self.store.stats.key_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn process(&mut self, mut entry: Entry) -> Outcome {
        let old_generation = entry.generation;
        if old_generation != self.generation {
            entry.generation = self.generation;
            self.store.stats.key_count.fetch_add(1, Ordering::SeqCst);
        }

        if entry.store_size == self.store_size {
            // Already hashed for the new capacity; just teach the forked
            // filter about it once.
            if old_generation != self.generation {
                self.store.bloom.add_forked(&entry.digested_routing_key);
                Outcome::Rewrite(entry)
            } else {
                Outcome::Keep
            }
        } else {
            if old_generation == self.generation {
                tracing::error!(
                    store = %self.store.name(),
                    offset = ?entry.cur_offset,
                    "current-generation entry hashed for a stale capacity"
                );
                self.store.bloom.remove(&entry.digested_routing_key);
            }
            if let Some(offset) = entry.cur_offset {
                match self.store.files.read_hd(offset) {
                    Ok((header, data)) => {
                        entry.set_hd(header, data);
                        self.queue.push_back(entry);
                        if self.queue.len() > BATCH_SIZE as usize {
                            self.queue.pop_front();
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            store = %self.store.name(),
                            offset,
                            error = %err,
                            "error reading entry for relocation"
                        );
                    }
                }
            }
            Outcome::Free
        }
    }

    fn batch(&mut self, entries_left: u64) -> bool {
        self.batches += 1;
        if self.batches % CONFIG_WRITE_BATCHES == 0 {
            self.store.persist_config_now();
        }

        // Shrink the files behind the walk.
        if self.store_size < self.prev_store_size {
            let target = self.store_size.max(entries_left);
            let mut rng = self.store.rng.lock();
            if let Err(err) = self.store.files.set_store_file_size(
                target,
                self.store.options.preallocate,
                &mut **rng,
            ) {
                tracing::error!(store = %self.store.name(), error = %err, "error shrinking store files");
            }
        }

        let store = self.store;
        let store_size = self.store_size;
        let generation = self.generation;
        self.queue
            .retain_mut(|entry| !resolve_old_entry(store, store_size, generation, entry));

        // A fresh resize request aborted and replaced this one.
        self.store.config.read().prev_store_size == self.prev_store_size
    }

    fn abort(&mut self) {
        self.store.bloom.discard();
    }

    fn finish(&mut self) {
        {
            let mut config = self.store.config.write();
            if config.prev_store_size != self.prev_store_size {
                return;
            }
            self.store.bloom.merge();
            config.prev_store_size = 0;
            config.flags &= !FLAG_REBUILD_BLOOM;
            config.check_bloom = true;
            config.bloom_k = self.optimal_k;
        }
        tracing::info!(store = %self.store.name(), "finished resizing");
    }
}

/// Re-home one displaced entry into the new capacity's candidate slots.
/// Returns `true` when the entry needs no further handling (stored, or a
/// copy already is).
fn resolve_old_entry<A: BlockAdapter>(
    store: &SaltedHashStore<A>,
    store_size: u64,
    generation: u32,
    entry: &mut Entry,
) -> bool {
    entry.store_size = store_size;
    entry.generation = generation;
    let offsets = candidate_offsets(&entry.digested_routing_key, store_size);

    let _guard = match store.locks.lock_all(offsets) {
        Some(guard) => guard,
        None => return false,
    };

    for offset in offsets {
        match store.files.is_free_at(offset) {
            Ok(false) => match store.files.digested_key_at(offset) {
                Ok(key) if key == entry.digested_routing_key => return true,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(offset, error = %err, "error probing relocation target");
                }
            },
            Ok(true) => {}
            Err(err) => {
                tracing::debug!(offset, error = %err, "error probing relocation target");
            }
        }
    }

    for offset in offsets {
        if let Ok(true) = store.files.is_free_at(offset) {
            match store.files.write_entry(entry, offset) {
                Ok(()) => {
                    store.bloom.add_forked(&entry.digested_routing_key);
                    store.stats.key_count.fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                Err(err) => {
                    tracing::debug!(offset, error = %err, "error writing relocated entry");
                }
            }
        }
    }
    false
}

struct RebuildProcessor<'a, A: BlockAdapter> {
    store: &'a SaltedHashStore<A>,
    generation: u32,
    optimal_k: u32,
    batches: u64,
}

impl<A: BlockAdapter> BatchProcessor for RebuildProcessor<'_, A> {
    fn init(&mut self) -> Result<()> {
        let store_size = self.store.config.read().store_size;
        self.optimal_k = BloomFilter::optimal_k(self.store.options.bloom_filter_size, store_size);

        let mut config = self.store.config.write();
        config.generation = config.generation.wrapping_add(1);
        self.generation = config.generation;
        self.store.bloom.fork(self.optimal_k);
        self.store.stats.key_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn process(&mut self, mut entry: Entry) -> Outcome {
        if entry.generation != self.generation {
            self.store.bloom.add_forked(&entry.digested_routing_key);
            self.store.stats.key_count.fetch_add(1, Ordering::SeqCst);
            entry.generation = self.generation;
            Outcome::Rewrite(entry)
        } else {
            Outcome::Keep
        }
    }

    fn batch(&mut self, _entries_left: u64) -> bool {
        self.batches += 1;
        if self.batches % CONFIG_WRITE_BATCHES == 0 {
            self.store.persist_config_now();
        }
        // A resize takes priority; bail out and let it run first.
        self.store.config.read().prev_store_size == 0
    }

    fn abort(&mut self) {
        self.store.bloom.discard();
    }

    fn finish(&mut self) {
        {
            self.store.bloom.merge();
            let mut config = self.store.config.write();
            config.flags &= !FLAG_REBUILD_BLOOM;
            config.check_bloom = true;
            config.bloom_k = self.optimal_k;
        }
        tracing::info!(store = %self.store.name(), "finished rebuilding bloom filter");
    }
}
