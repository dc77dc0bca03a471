//! The store engine: an index-less, fixed-capacity, content-addressed block
//! store with pseudo-random replacement.
//!
//! There is no key→offset index anywhere. A block's candidate slots are
//! derived from its salted digest ([`crate::layout`]); lookups probe those
//! slots directly, inserts claim the first free one, and a full candidate
//! set evicts. A bloom filter in front of the disk absorbs most misses.
//!
//! Configuration is persisted as a little-endian fixed-offset record:
//!
//! ```text
//!       +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!       |0|1|2|3|4|5|6|7|8|9|A|B|C|D|E|F|
//!  +----+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |0x00|             Salt              |
//!  +----+---------------+---------------+
//!  |0x10|   Store Size  | PrevStoreSize |
//!  +----+---------------+-------+-------+
//!  |0x20| Est Key Count |  Gen  | Flags |
//!  +----+-------+-------+-------+-------+
//!  |0x30|   K   |      (reserved)       |
//!  +----+-------+-------+---------------+
//!  |0x40|    Writes     |     Hits      |
//!  +----+---------------+---------------+
//!  |0x50|    Misses     | BloomFalsePos |
//!  +----+---------------+---------------+
//! ```
//!
//! The dirty flag is set while the store is open and cleared only by an
//! orderly [`close`](SaltedHashStore::close); finding it set on open means
//! the last run died and the bloom filter can no longer be trusted, so a
//! rebuild is scheduled.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use rand::{Rng, RngCore};

use crate::block::{BlockAdapter, RoutingKey, StorableBlock};
use crate::errcorrupt;
use crate::bloom::BloomFilter;
use crate::cipher::{CipherManager, SALT_LENGTH};
use crate::cleaner;
use crate::config::StoreOptions;
use crate::entry::{Entry, FLAG_NEW_BLOCK, FLAG_OCCUPIED, FLAG_WRONG_STORE};
use crate::error::{Error, Result};
use crate::files::SlotFiles;
use crate::flock::StoreLock;
use crate::layout::{candidate_offsets, MAX_PROBE};
use crate::locks::{LockManager, SlotGuard};

/// Length of the persisted config record.
const CONFIG_LENGTH: usize = 96;

/// Store did not shut down cleanly.
pub(crate) const FLAG_DIRTY: u32 = 0x1;
/// The bloom filter has drifted or was lost; rebuild it.
pub(crate) const FLAG_REBUILD_BLOOM: u32 = 0x2;

const CONFIG_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const CONFIG_LOCK_RETRIES: u32 = 10;

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The block was written to a slot (possibly of the secondary store).
    Inserted,
    /// An equal block was already present under this routing key.
    AlreadyStored,
    /// Nothing was written: the store is shutting down, or an overflow
    /// insert lost the eviction-balancing coin toss.
    Rejected,
}

/// A snapshot of access counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub bloom_false_positives: u64,
}

/// Mutable store configuration, guarded by the config lock. Foreground
/// operations hold it shared; structural changes (resize start, maintenance
/// epochs, flag changes) hold it exclusively.
pub(crate) struct Config {
    pub store_size: u64,
    pub prev_store_size: u64,
    pub generation: u32,
    pub flags: u32,
    pub bloom_k: u32,
    pub check_bloom: bool,
}

pub(crate) struct Stats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub key_count: AtomicU64,
    pub bloom_false_pos: AtomicU64,
    initial_hits: u64,
    initial_misses: u64,
    initial_writes: u64,
    initial_bloom_false_pos: u64,
}

impl Stats {
    fn new(key_count: u64, writes: u64, hits: u64, misses: u64, bloom_false_pos: u64) -> Self {
        Self {
            hits: AtomicU64::new(hits),
            misses: AtomicU64::new(misses),
            writes: AtomicU64::new(writes),
            key_count: AtomicU64::new(key_count),
            bloom_false_pos: AtomicU64::new(bloom_false_pos),
            initial_hits: hits,
            initial_misses: misses,
            initial_writes: writes,
            initial_bloom_false_pos: bloom_false_pos,
        }
    }

    pub(crate) fn decrement_key_count(&self) {
        let _ = self
            .key_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }
}

/// Wake-up line between the store and its cleaner thread.
pub(crate) struct CleanerSignal {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl CleanerSignal {
    fn new() -> Self {
        Self {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.woken.lock() = true;
        self.condvar.notify_all();
    }

    /// Sleep until notified or `timeout` elapses. A notification that
    /// arrived while the cleaner was busy is consumed immediately.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.condvar.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
}

/// Entries-processed / entries-total of the current maintenance sweep.
pub(crate) struct Progress {
    active: AtomicBool,
    processed: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub(crate) fn start(&self, total: u64) {
        self.processed.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }

    pub(crate) fn update(&self, processed: u64) {
        self.processed.store(processed, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn get(&self) -> Option<(u64, u64)> {
        if self.active.load(Ordering::Relaxed) {
            Some((
                self.processed.load(Ordering::Relaxed),
                self.total.load(Ordering::Relaxed),
            ))
        } else {
            None
        }
    }
}

/// Index-less salted-hash block store.
pub struct SaltedHashStore<A: BlockAdapter> {
    name: String,
    config_path: PathBuf,
    bloom_path: PathBuf,

    pub(crate) adapter: A,
    pub(crate) options: StoreOptions,
    pub(crate) config: RwLock<Config>,
    pub(crate) cipher: CipherManager,
    pub(crate) files: SlotFiles,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) bloom: BloomFilter,
    pub(crate) stats: Stats,
    pub(crate) rng: Mutex<Box<dyn RngCore + Send>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) cleaner_signal: Arc<CleanerSignal>,
    pub(crate) progress: Progress,

    alt_store: RwLock<Option<Arc<SaltedHashStore<A>>>>,
    started: AtomicBool,
    closed: AtomicBool,
    cleaner_handle: Mutex<Option<JoinHandle<()>>>,
    _lock: StoreLock,
}

impl<A: BlockAdapter> SaltedHashStore<A> {
    /// Open or create the store `<name>` under `base_dir`.
    ///
    /// A persisted capacity differing from `options.max_keys` starts a
    /// resize, completed by the cleaner (or synchronously here when
    /// `resize_on_start` is set). Call [`start`](Self::start) afterwards to
    /// verify file sizes and launch the cleaner.
    pub fn open(
        base_dir: impl AsRef<Path>,
        name: &str,
        adapter: A,
        mut rng: Box<dyn RngCore + Send>,
        options: StoreOptions,
    ) -> Result<Arc<Self>> {
        if options.max_keys == 0 {
            return Err(Error::InvalidInput("store size must be nonzero".into()));
        }
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir)?;
        let lock = StoreLock::acquire(base_dir, name)?;

        let config_path = base_dir.join(format!("{name}.config"));
        let bloom_path = base_dir.join(format!("{name}.bloom"));

        let loaded = load_config(&config_path, base_dir, name, &mut *rng, &options)?;
        let mut new_store = loaded.new_store;
        let cipher = loaded.cipher;
        let mut config = loaded.config;
        let stats = loaded.stats;

        let (files, files_created) =
            SlotFiles::open(base_dir, name, adapter.header_len(), adapter.data_len())?;
        new_store |= files_created;

        let bloom = BloomFilter::open(
            &bloom_path,
            options.bloom_filter_size,
            config.bloom_k,
            options.counting_bloom,
        )?;

        if config.flags & FLAG_DIRTY != 0 {
            tracing::warn!(store = name, "store was not shut down cleanly");
        }
        if bloom.needs_rebuild() && !new_store {
            config.flags |= FLAG_REBUILD_BLOOM;
            config.check_bloom = false;
        }
        // Dirty from here until close() clears it.
        config.flags |= FLAG_DIRTY;

        let store = Arc::new(Self {
            name: name.to_string(),
            config_path,
            bloom_path,
            adapter,
            config: RwLock::new(config),
            cipher,
            files,
            locks: LockManager::new(),
            bloom,
            stats,
            rng: Mutex::new(rng),
            shutdown: AtomicBool::new(false),
            cleaner_signal: Arc::new(CleanerSignal::new()),
            progress: Progress::new(),
            alt_store: RwLock::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cleaner_handle: Mutex::new(None),
            options,
            _lock: lock,
        });

        store.persist_config_now();

        if store.options.resize_on_start {
            let prev = store.config.read().prev_store_size;
            if prev != 0 {
                if let Some(_latch) = crate::locks::try_maintenance_latch() {
                    tracing::info!(store = %store.name, "completing resize before startup");
                    store.files.init_offset_ready()?;
                    cleaner::resize_store(&store, prev, None);
                    store.persist_config_now();
                }
            }
        }

        {
            let config = store.config.read();
            tracing::info!(
                store = %store.name,
                capacity = config.store_size,
                prev_capacity = config.prev_store_size,
                check_bloom = config.check_bloom,
                flags = config.flags,
                "store opened"
            );
        }

        Ok(store)
    }

    /// Pad store files if needed and launch the cleaner thread.
    ///
    /// If the files are short of the current capacity epoch and `long_start`
    /// is false, nothing is touched and `true` is returned: the caller
    /// should retry with `long_start = true` when it can afford a long
    /// synchronous preallocation.
    pub fn start(self: &Arc<Self>, long_start: bool) -> Result<bool> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let (meta_len, hd_len) = self.files.lengths()?;
        let (store_size, prev_store_size) = {
            let config = self.config.read();
            (config.store_size, config.prev_store_size)
        };

        // While resizing, live slots may exist in either epoch; only the
        // smaller one is required to be fully backed right now.
        let mut smaller_size = store_size;
        if prev_store_size != 0 && prev_store_size < store_size {
            smaller_size = prev_store_size;
        }

        if smaller_size * crate::entry::METADATA_LENGTH as u64 > meta_len
            || smaller_size * self.files.hd_stride() > hd_len
        {
            if !long_start {
                self.started.store(false, Ordering::SeqCst);
                return Ok(true);
            }
            let mut rng = self.rng.lock();
            self.files
                .set_store_file_size(store_size, self.options.preallocate, &mut **rng)?;
        }

        self.files.init_offset_ready()?;

        let handle = cleaner::spawn(
            Arc::downgrade(self),
            self.name.clone(),
            self.options.cleaner.clone(),
            Arc::clone(&self.cleaner_signal),
        )?;
        *self.cleaner_handle.lock() = Some(handle);

        Ok(false)
    }

    /// Look up a block by routing key.
    ///
    /// Returns `Ok(None)` on a miss, a bloom rejection, a verification
    /// failure, or while shutting down.
    pub fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
    ) -> Result<Option<A::Block>> {
        let config = match self.lock_config_read()? {
            Some(config) => config,
            None => return Ok(None),
        };
        let digested = self.cipher.digested_key(routing_key);
        let _guard = match self.lock_key_offsets(&digested, &config, true) {
            Some(guard) => guard,
            None => return Ok(None),
        };

        match self.probe_block(routing_key, full_key, &digested, &config)? {
            Some(block) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(block))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a block.
    ///
    /// `overwrite` resolves genuine routing-key collisions in favour of the
    /// incoming block instead of raising [`Error::KeyCollision`].
    /// `is_new_block` sets (or upgrades) the *new-block* bit.
    pub fn put(&self, block: &A::Block, overwrite: bool, is_new_block: bool) -> Result<PutOutcome> {
        self.put_inner(block, overwrite, is_new_block, false)
    }

    fn put_inner(
        &self,
        block: &A::Block,
        overwrite: bool,
        is_new_block: bool,
        wrong_store: bool,
    ) -> Result<PutOutcome> {
        let mut schedule_rebuild = false;
        let result = self.put_locked(block, overwrite, is_new_block, wrong_store, &mut schedule_rebuild);
        // The rebuild flag needs the config lock exclusively, so it is only
        // raised after put_locked has released its shared hold.
        if schedule_rebuild {
            self.flag_rebuild_bloom();
        }
        result
    }

    fn put_locked(
        &self,
        block: &A::Block,
        overwrite: bool,
        is_new_block: bool,
        wrong_store: bool,
        schedule_rebuild: &mut bool,
    ) -> Result<PutOutcome> {
        let routing_key = block.routing_key();
        let config = match self.lock_config_read()? {
            Some(config) => config,
            None => return Ok(PutOutcome::Rejected),
        };
        let digested = self.cipher.digested_key(routing_key);
        let _guard = match self.lock_key_offsets(&digested, &config, false) {
            Some(guard) => guard,
            None => return Ok(PutOutcome::Rejected),
        };

        // An entry under the same digested key, if any, must be reused or
        // overwritten in place; a second slot for the same key would leave
        // lookups nondeterministic.
        if let Some(old_entry) = self.probe_entry_meta(&digested, &config)? {
            let old_offset = match old_entry.cur_offset {
                Some(offset) => offset,
                None => return Err(Error::Eof),
            };

            if !self.adapter.collision_possible() {
                // The digested key is cryptographic: a match is the block.
                if old_entry.flags & FLAG_NEW_BLOCK == 0 && is_new_block {
                    self.upgrade_new_block(routing_key, &digested, old_offset, &config)?;
                }
                return Ok(PutOutcome::AlreadyStored);
            }

            if let Some(mut stored) = self.files.read_entry(old_offset, Some(&digested), true)? {
                self.cipher.decrypt(&mut stored, routing_key);
                let constructed = stored.hd.as_ref().and_then(|hd| {
                    self.adapter
                        .construct(&hd.header, &hd.data, routing_key, Some(block.full_key()))
                        .ok()
                });
                if let Some(old_block) = constructed {
                    if old_block == *block {
                        if stored.flags & FLAG_NEW_BLOCK == 0 && is_new_block {
                            stored.flags |= FLAG_NEW_BLOCK;
                            stored.store_size = config.store_size;
                            self.write_encrypted(&mut stored, old_offset)?;
                        }
                        return Ok(PutOutcome::AlreadyStored);
                    }
                    if !overwrite {
                        return Err(Error::KeyCollision);
                    }
                }
                // Verification failure: the slot content is garbage; fall
                // through and overwrite it.
            }

            let mut entry = self.new_entry(block, is_new_block, wrong_store, &config);
            self.write_encrypted(&mut entry, old_offset)?;
            *schedule_rebuild = self.on_write(&config);
            if old_entry.generation != config.generation {
                self.stats.key_count.fetch_add(1, Ordering::SeqCst);
            }
            return Ok(PutOutcome::Inserted);
        }

        // No slot holds this key yet: claim the first free candidate.
        let offsets = candidate_offsets(&digested, config.store_size);
        let mut first_wrong_store = None;
        let mut wrong_store_count = 0u32;

        for offset in offsets {
            if !self.files.writable_at(offset) {
                continue;
            }
            let flags = self.files.flags_at(offset)?;
            if flags & FLAG_OCCUPIED == 0 {
                let mut entry = self.new_entry(block, is_new_block, wrong_store, &config);
                self.bloom.add(&digested);
                self.write_encrypted(&mut entry, offset)?;
                *schedule_rebuild = self.on_write(&config);
                self.stats.key_count.fetch_add(1, Ordering::SeqCst);
                return Ok(PutOutcome::Inserted);
            }
            if flags & FLAG_WRONG_STORE != 0 {
                if wrong_store_count == 0 {
                    first_wrong_store = Some(offset);
                }
                wrong_store_count += 1;
            }
        }

        // All candidates taken: offer the block to the secondary store
        // before evicting anything here. Overflow inserts never chain
        // further, which bounds the recursion at depth one.
        if !wrong_store {
            let alt = self.alt_store.read().clone();
            if let Some(alt) = alt {
                match alt.put_inner(block, overwrite, is_new_block, true)? {
                    PutOutcome::Inserted | PutOutcome::AlreadyStored => {
                        tracing::debug!(store = %self.name, "block overflowed to secondary store");
                        return Ok(PutOutcome::Inserted);
                    }
                    PutOutcome::Rejected => {}
                }
            }
        }

        // Someone must be evicted.
        let victim = if wrong_store {
            // Balance eviction pressure between the natural store and this
            // one: overwrite one of our wrong-store slots with probability
            // w / (P + w), otherwise refuse and let the natural store evict.
            let total = MAX_PROBE as u32 + wrong_store_count;
            let roll = self.rng.lock().gen_range(0..total);
            match first_wrong_store {
                Some(offset) if roll < wrong_store_count => offset,
                _ => return Ok(PutOutcome::Rejected),
            }
        } else {
            offsets[0]
        };

        self.bloom.add(&digested);
        let displaced = match self.files.read_entry(victim, None, false)? {
            Some(entry) => entry,
            None => return Err(Error::Eof),
        };
        let mut entry = self.new_entry(block, is_new_block, wrong_store, &config);
        self.write_encrypted(&mut entry, victim)?;
        *schedule_rebuild = self.on_write(&config);
        if displaced.generation == config.generation && displaced.flags & FLAG_OCCUPIED != 0 {
            self.bloom.remove(&displaced.digested_routing_key);
        } else {
            self.stats.key_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(PutOutcome::Inserted)
    }

    /// Bloom-filter membership guess. `false` guarantees the key is absent;
    /// `true` means the disk must be probed (always the answer while the
    /// filter is distrusted).
    pub fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let config = self.config.read();
        if !config.check_bloom {
            return true;
        }
        self.bloom.test(&self.cipher.digested_key(routing_key))
    }

    /// Request a capacity change. Returns immediately; the cleaner migrates
    /// slots in the background. Ignored if a resize is already running.
    pub fn set_max_keys(&self, new_store_size: u64) -> Result<()> {
        if new_store_size == 0 {
            return Err(Error::InvalidInput("store size must be nonzero".into()));
        }
        {
            let mut config = self.config.write();
            if new_store_size == config.store_size {
                return Ok(());
            }
            if config.prev_store_size != 0 {
                tracing::info!(
                    store = %self.name,
                    "resize already in progress, ignoring resize request"
                );
                return Ok(());
            }
            tracing::info!(
                store = %self.name,
                from = config.store_size,
                to = new_store_size,
                "starting resize"
            );
            config.prev_store_size = config.store_size;
            config.store_size = new_store_size;
            self.persist_config(&config)?;
        }
        self.cleaner_signal.notify();
        Ok(())
    }

    /// Attach an overflow target for inserts that find all candidates
    /// occupied. The link must stay one-directional: a target that already
    /// chains to its own secondary is rejected, which also rules out cycles.
    pub fn set_alt_store(&self, alt: Arc<SaltedHashStore<A>>) -> Result<()> {
        if alt.alt_store.read().is_some() {
            return Err(Error::InvalidInput(
                "secondary store must not have a secondary of its own".into(),
            ));
        }
        *self.alt_store.write() = Some(alt);
        Ok(())
    }

    /// Orderly shutdown: unblock waiters, stop the cleaner, flush
    /// everything, clear the dirty bit. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.locks.shutdown();
        self.cleaner_signal.notify();
        if let Some(handle) = self.cleaner_handle.lock().take() {
            let _ = handle.join();
        }

        let mut config = self.config.write();
        if let Err(err) = self.files.force() {
            tracing::error!(store = %self.name, error = %err, "error flushing store files");
        }
        if let Err(err) = self.bloom.force() {
            tracing::error!(store = %self.name, error = %err, "error flushing bloom filter");
        }
        config.flags &= !FLAG_DIRTY;
        if let Err(err) = self.persist_config(&config) {
            tracing::error!(store = %self.name, error = %err, "error writing config record");
        }
        tracing::info!(store = %self.name, "store closed");
    }

    /// Delete all four store files. Call after [`close`](Self::close).
    pub fn destroy(&self) -> Result<()> {
        for path in [
            self.files.meta_path(),
            self.files.hd_path(),
            self.config_path.as_path(),
            self.bloom_path.as_path(),
        ] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // ------------- accessors

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_keys(&self) -> u64 {
        self.config.read().store_size
    }

    pub fn key_count(&self) -> u64 {
        self.stats.key_count.load(Ordering::SeqCst)
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    pub fn bloom_false_positives(&self) -> u64 {
        self.stats.bloom_false_pos.load(Ordering::Relaxed)
    }

    /// Counters accumulated over the store's whole life.
    pub fn total_stats(&self) -> AccessStats {
        AccessStats {
            hits: self.hits(),
            misses: self.misses(),
            writes: self.writes(),
            bloom_false_positives: self.bloom_false_positives(),
        }
    }

    /// Counters accumulated since this open.
    pub fn session_stats(&self) -> AccessStats {
        AccessStats {
            hits: self.hits() - self.stats.initial_hits,
            misses: self.misses() - self.stats.initial_misses,
            writes: self.writes() - self.stats.initial_writes,
            bloom_false_positives: self.bloom_false_positives()
                - self.stats.initial_bloom_false_pos,
        }
    }

    pub fn resize_in_progress(&self) -> bool {
        self.config.read().prev_store_size != 0
    }

    /// `(processed, total)` of the current maintenance sweep, if one runs.
    pub fn cleaner_progress(&self) -> Option<(u64, u64)> {
        self.progress.get()
    }

    // ------------- internals

    /// Take the config lock shared, retrying every 2 s up to 10 times.
    /// `Ok(None)` means shutdown won the race; exhausting the retries is an
    /// I/O error.
    fn lock_config_read(&self) -> Result<Option<RwLockReadGuard<'_, Config>>> {
        let mut retry = 0;
        loop {
            if let Some(guard) = self.config.try_read_for(CONFIG_LOCK_TIMEOUT) {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                return Ok(Some(guard));
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            retry += 1;
            if retry > CONFIG_LOCK_RETRIES {
                return Err(Error::IO("config lock timeout (20s)".into()));
            }
        }
    }

    /// Lock every candidate offset of a key, in the current capacity and —
    /// when probing during a resize — the previous one too. Ascending
    /// order; `None` on shutdown.
    fn lock_key_offsets(
        &self,
        digested: &[u8; 32],
        config: &Config,
        use_prev_store_size: bool,
    ) -> Option<SlotGuard> {
        let mut wanted: Vec<u64> = candidate_offsets(digested, config.store_size).to_vec();
        if use_prev_store_size && config.prev_store_size != 0 {
            wanted.extend(candidate_offsets(digested, config.prev_store_size));
        }
        self.locks.lock_all(wanted)
    }

    fn new_entry(
        &self,
        block: &A::Block,
        is_new_block: bool,
        wrong_store: bool,
        config: &Config,
    ) -> Entry {
        Entry::new(
            *block.routing_key(),
            self.cipher.digested_key(block.routing_key()),
            block.header(),
            block.data(),
            is_new_block,
            wrong_store,
            config.store_size,
            config.generation,
        )
    }

    pub(crate) fn write_encrypted(&self, entry: &mut Entry, offset: u64) -> Result<()> {
        {
            let mut rng = self.rng.lock();
            self.cipher.encrypt(entry, &mut **rng);
        }
        self.files.write_entry(entry, offset)
    }

    /// Count a slot write; every `2 × capacity` writes the caller should
    /// schedule a bloom rebuild to shed accumulated drift.
    fn on_write(&self, config: &Config) -> bool {
        let writes = self.stats.writes.fetch_add(1, Ordering::SeqCst) + 1;
        writes % (config.store_size * 2) == 0
    }

    fn flag_rebuild_bloom(&self) {
        let mut config = self.config.write();
        config.flags |= FLAG_REBUILD_BLOOM;
        config.check_bloom = false;
    }

    /// Find, decrypt, verify and return the block for a key, probing the
    /// current capacity and then — during a resize — the previous one.
    fn probe_block(
        &self,
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
        digested: &[u8; 32],
        config: &Config,
    ) -> Result<Option<A::Block>> {
        if config.check_bloom && !self.bloom.test(digested) {
            return Ok(None);
        }

        let quiescent = config.prev_store_size == 0;
        if let Some(block) =
            self.probe_block_in(routing_key, full_key, digested, config.store_size, quiescent)?
        {
            return Ok(Some(block));
        }
        if config.prev_store_size != 0 {
            if let Some(block) =
                self.probe_block_in(routing_key, full_key, digested, config.prev_store_size, false)?
            {
                return Ok(Some(block));
            }
        }

        if config.check_bloom {
            self.stats.bloom_false_pos.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    fn probe_block_in(
        &self,
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
        digested: &[u8; 32],
        capacity: u64,
        eof_unexpected: bool,
    ) -> Result<Option<A::Block>> {
        for offset in candidate_offsets(digested, capacity) {
            if !self.files.readable_at(offset) {
                continue;
            }
            let mut entry = match self.files.read_entry(offset, Some(digested), true) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(Error::Eof) => {
                    if eof_unexpected {
                        tracing::error!(store = %self.name, offset, "read past end of store file");
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.cipher.decrypt(&mut entry, routing_key);
            let hd = match entry.hd.as_ref() {
                Some(hd) => hd,
                None => continue,
            };
            match self.adapter.construct(&hd.header, &hd.data, routing_key, full_key) {
                Ok(block) if block.routing_key() == routing_key => return Ok(Some(block)),
                Ok(_) | Err(_) => {
                    tracing::debug!(store = %self.name, offset, "stored block failed verification");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Metadata-only probe used by `put`, with the same bloom gating and
    /// false-positive accounting as a lookup.
    fn probe_entry_meta(&self, digested: &[u8; 32], config: &Config) -> Result<Option<Entry>> {
        if config.check_bloom && !self.bloom.test(digested) {
            return Ok(None);
        }

        let mut entry = self.probe_entry_in(digested, config.store_size, config.prev_store_size == 0)?;
        if entry.is_none() && config.prev_store_size != 0 {
            entry = self.probe_entry_in(digested, config.prev_store_size, false)?;
        }

        if config.check_bloom && entry.is_none() {
            self.stats.bloom_false_pos.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry)
    }

    fn probe_entry_in(
        &self,
        digested: &[u8; 32],
        capacity: u64,
        eof_unexpected: bool,
    ) -> Result<Option<Entry>> {
        for offset in candidate_offsets(digested, capacity) {
            if !self.files.readable_at(offset) {
                continue;
            }
            match self.files.read_entry(offset, Some(digested), false) {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => continue,
                Err(Error::Eof) => {
                    if eof_unexpected {
                        tracing::error!(store = %self.name, offset, "read past end of store file");
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Rewrite an entry with the *new-block* bit set and the current
    /// capacity stamped.
    fn upgrade_new_block(
        &self,
        routing_key: &RoutingKey,
        digested: &[u8; 32],
        offset: u64,
        config: &Config,
    ) -> Result<()> {
        if let Some(mut entry) = self.files.read_entry(offset, Some(digested), true)? {
            self.cipher.decrypt(&mut entry, routing_key);
            entry.flags |= FLAG_NEW_BLOCK;
            entry.store_size = config.store_size;
            self.write_encrypted(&mut entry, offset)?;
        }
        Ok(())
    }

    /// Persist the config record under whatever config-lock hold the caller
    /// has; logs instead of failing.
    pub(crate) fn persist_config_now(&self) {
        let config = self.config.read();
        if let Err(err) = self.persist_config(&config) {
            tracing::error!(store = %self.name, error = %err, "error writing config record");
        }
    }

    pub(crate) fn persist_config(&self, config: &Config) -> Result<()> {
        let mut buf = [0u8; CONFIG_LENGTH];
        buf[0x00..0x10].copy_from_slice(self.cipher.disk_salt());
        LittleEndian::write_u64(&mut buf[0x10..0x18], config.store_size);
        LittleEndian::write_u64(&mut buf[0x18..0x20], config.prev_store_size);
        LittleEndian::write_u64(&mut buf[0x20..0x28], self.stats.key_count.load(Ordering::SeqCst));
        LittleEndian::write_u32(&mut buf[0x28..0x2C], config.generation);
        LittleEndian::write_u32(&mut buf[0x2C..0x30], config.flags);
        LittleEndian::write_u32(&mut buf[0x30..0x34], config.bloom_k);
        LittleEndian::write_u64(&mut buf[0x40..0x48], self.stats.writes.load(Ordering::Relaxed));
        LittleEndian::write_u64(&mut buf[0x48..0x50], self.stats.hits.load(Ordering::Relaxed));
        LittleEndian::write_u64(&mut buf[0x50..0x58], self.stats.misses.load(Ordering::Relaxed));
        LittleEndian::write_u64(
            &mut buf[0x58..0x60],
            self.stats.bloom_false_pos.load(Ordering::Relaxed),
        );

        let tmp_path = self.config_path.with_extension("config.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.config_path)?;
        Ok(())
    }
}

struct LoadedConfig {
    cipher: CipherManager,
    config: Config,
    stats: Stats,
    new_store: bool,
}

/// Load or create the config record. A corrupted record is recovered from
/// exactly once: config and metadata files are deleted and the store is
/// re-created (the header+data file is left behind; its stale content fails
/// decryption under the new salt and reads as garbage).
fn load_config(
    config_path: &Path,
    base_dir: &Path,
    name: &str,
    rng: &mut (dyn RngCore + Send),
    options: &StoreOptions,
) -> Result<LoadedConfig> {
    let mut recovered = false;
    loop {
        match try_load_config(config_path, rng, options) {
            Ok(loaded) => return Ok(loaded),
            Err(err) => {
                if recovered {
                    return Err(err);
                }
                tracing::error!(
                    store = name,
                    error = %err,
                    "config record corrupted, recreating store"
                );
                fs::remove_file(config_path)?;
                let meta_path = base_dir.join(format!("{name}.metadata"));
                match fs::remove_file(&meta_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                recovered = true;
            }
        }
    }
}

fn try_load_config(
    config_path: &Path,
    rng: &mut (dyn RngCore + Send),
    options: &StoreOptions,
) -> Result<LoadedConfig> {
    let bytes = match fs::read(config_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Fresh store.
            let cipher = CipherManager::create(rng, options.master_key.as_ref());
            let bloom_k = BloomFilter::optimal_k(options.bloom_filter_size, options.max_keys);
            return Ok(LoadedConfig {
                cipher,
                config: Config {
                    store_size: options.max_keys,
                    prev_store_size: 0,
                    generation: 0,
                    flags: 0,
                    bloom_k,
                    check_bloom: true,
                },
                stats: Stats::new(0, 0, 0, 0, 0),
                new_store: true,
            });
        }
        Err(err) => return Err(err.into()),
    };

    // Salt through flags are required; k and the counters came later and
    // default when the record is short.
    if bytes.len() < 0x30 {
        return errcorrupt!("config record too short: {} bytes", bytes.len());
    }

    let mut disk_salt = [0u8; SALT_LENGTH];
    disk_salt.copy_from_slice(&bytes[0x00..0x10]);
    let cipher = CipherManager::from_disk_salt(disk_salt, options.master_key.as_ref());

    let mut store_size = LittleEndian::read_u64(&bytes[0x10..0x18]);
    if store_size == 0 {
        return errcorrupt!("bogus store size in config record");
    }
    let mut prev_store_size = LittleEndian::read_u64(&bytes[0x18..0x20]);
    let key_count = LittleEndian::read_u64(&bytes[0x20..0x28]);
    let generation = LittleEndian::read_u32(&bytes[0x28..0x2C]);
    let mut flags = LittleEndian::read_u32(&bytes[0x2C..0x30]);
    let mut check_bloom = true;

    // A dirty bit means the last run died mid-write: every counter in the
    // bloom filter is suspect.
    if flags & FLAG_DIRTY != 0 {
        flags |= FLAG_REBUILD_BLOOM;
    }

    let mut bloom_k = if bytes.len() >= 0x34 {
        LittleEndian::read_u32(&bytes[0x30..0x34])
    } else {
        0
    };
    if bloom_k == 0 {
        bloom_k = BloomFilter::optimal_k(options.bloom_filter_size, store_size);
        flags |= FLAG_REBUILD_BLOOM;
        check_bloom = false;
    }

    let (writes, hits, misses, bloom_false_pos) = if bytes.len() >= 0x60 {
        (
            LittleEndian::read_u64(&bytes[0x40..0x48]),
            LittleEndian::read_u64(&bytes[0x48..0x50]),
            LittleEndian::read_u64(&bytes[0x50..0x58]),
            LittleEndian::read_u64(&bytes[0x58..0x60]),
        )
    } else {
        (0, 0, 0, 0)
    };

    // Start resizing toward the requested capacity unless one is already
    // under way.
    if store_size != options.max_keys && prev_store_size == 0 {
        prev_store_size = store_size;
        store_size = options.max_keys;
    }

    Ok(LoadedConfig {
        cipher,
        config: Config {
            store_size,
            prev_store_size,
            generation,
            flags,
            bloom_k,
            check_bloom,
        },
        stats: Stats::new(key_count, writes, hits, misses, bloom_false_pos),
        new_store: false,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block::testing::{routing_key, TestAdapter, TestBlock};
    use crate::config::CleanerOptions;
    use crate::tmpfs::TempDir;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::thread;

    pub(crate) fn test_options(max_keys: u64) -> StoreOptions {
        StoreOptions::new(max_keys)
            .bloom_filter_size(max_keys.max(16) * 16)
            .cleaner(
                CleanerOptions::default()
                    .period(Duration::from_millis(20))
                    .jitter(false)
                    .batch_sleep(Duration::ZERO),
            )
    }

    /// Options whose cleaner stays parked for the whole test, for stores
    /// that are dropped without close() (the thread must never wake and
    /// briefly revive the store while a reopen races it).
    pub(crate) fn parked_cleaner_options(max_keys: u64) -> StoreOptions {
        test_options(max_keys).cleaner(
            CleanerOptions::default()
                .period(Duration::from_secs(3600))
                .jitter(false),
        )
    }

    pub(crate) fn open_store(
        dir: &Path,
        name: &str,
        seed: u64,
        options: StoreOptions,
    ) -> Arc<SaltedHashStore<TestAdapter>> {
        let store = SaltedHashStore::open(
            dir,
            name,
            TestAdapter,
            Box::new(StdRng::seed_from_u64(seed)),
            options,
        )
        .unwrap();
        assert!(!store.start(true).unwrap());
        store
    }

    /// Count candidate slots currently holding this digested key.
    fn slots_holding(store: &SaltedHashStore<TestAdapter>, digested: &[u8; 32]) -> usize {
        let capacity = store.max_keys();
        candidate_offsets(digested, capacity)
            .iter()
            .filter(|&&offset| {
                !store.files.is_free_at(offset).unwrap()
                    && store.files.digested_key_at(offset).unwrap() == *digested
            })
            .count()
    }

    #[test]
    fn test_empty_store_miss() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 1, test_options(1024));

        assert!(store.fetch(&routing_key(1), None).unwrap().is_none());
        assert_eq!(store.misses(), 1);
        assert_eq!(store.hits(), 0);
        assert_eq!(store.bloom_false_positives(), 0);
        store.close();
    }

    #[test]
    fn test_insert_then_fetch() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 2, test_options(1024));

        let key = [0u8; 32];
        let block = TestBlock::new(key, 7);
        assert_eq!(store.put(&block, false, true).unwrap(), PutOutcome::Inserted);

        let fetched = store.fetch(&key, None).unwrap().unwrap();
        assert_eq!(fetched, block);
        assert_eq!(store.hits(), 1);
        assert_eq!(store.writes(), 1);
        assert_eq!(store.key_count(), 1);
        store.close();
    }

    #[test]
    fn test_put_same_block_is_already_stored() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 3, test_options(256));

        let block = TestBlock::new(routing_key(1), 1);
        assert_eq!(store.put(&block, false, true).unwrap(), PutOutcome::Inserted);
        assert_eq!(
            store.put(&block, false, true).unwrap(),
            PutOutcome::AlreadyStored
        );
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.writes(), 1);
        store.close();
    }

    #[test]
    fn test_collision_raises_unless_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 4, test_options(256));

        let key = routing_key(9);
        let original = TestBlock::new(key, 1);
        let colliding = TestBlock::new(key, 2);

        store.put(&original, false, true).unwrap();
        assert!(matches!(
            store.put(&colliding, false, true),
            Err(Error::KeyCollision)
        ));
        // The original survives a refused overwrite.
        assert_eq!(store.fetch(&key, None).unwrap().unwrap(), original);

        assert_eq!(
            store.put(&colliding, true, true).unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(store.fetch(&key, None).unwrap().unwrap(), colliding);
        assert_eq!(store.key_count(), 1);
        store.close();
    }

    #[test]
    fn test_new_block_flag_upgrade() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 5, test_options(256));

        let key = routing_key(4);
        let block = TestBlock::new(key, 4);
        store.put(&block, false, false).unwrap();

        let digested = store.cipher.digested_key(&key);
        let offset = candidate_offsets(&digested, store.max_keys())
            .into_iter()
            .find(|&offset| store.files.digested_key_at(offset).unwrap() == digested)
            .unwrap();
        assert_eq!(store.files.flags_at(offset).unwrap() & FLAG_NEW_BLOCK, 0);

        assert_eq!(
            store.put(&block, false, true).unwrap(),
            PutOutcome::AlreadyStored
        );
        assert_ne!(store.files.flags_at(offset).unwrap() & FLAG_NEW_BLOCK, 0);
        // Still one copy, still fetchable after the rewrite.
        assert_eq!(store.fetch(&key, None).unwrap().unwrap(), block);
        assert_eq!(slots_holding(&store, &digested), 1);
        store.close();
    }

    #[test]
    fn test_tiny_store_evicts_first_candidate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 6, test_options(5));

        // Capacity equals the probe count, so every key's candidate set is
        // the whole store: five inserts fill it completely.
        let blocks: Vec<TestBlock> = (0..5)
            .map(|i| TestBlock::new(routing_key(i), i as u8))
            .collect();
        for block in &blocks {
            assert_eq!(store.put(block, false, true).unwrap(), PutOutcome::Inserted);
        }
        for block in &blocks {
            assert_eq!(
                store.fetch(&block.routing_key, None).unwrap().unwrap(),
                *block
            );
        }

        let sixth = TestBlock::new(routing_key(99), 9);
        assert_eq!(store.put(&sixth, false, true).unwrap(), PutOutcome::Inserted);
        assert_eq!(
            store.fetch(&sixth.routing_key, None).unwrap().unwrap(),
            sixth
        );

        // Exactly one of the originals was evicted.
        let survivors = blocks
            .iter()
            .filter(|block| {
                store
                    .fetch(&block.routing_key, None)
                    .unwrap()
                    .is_some()
            })
            .count();
        assert_eq!(survivors, 4);
        store.close();
    }

    #[test]
    fn test_bloom_false_positive_counted() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 7, test_options(1024));

        // Simulate filter drift: the bloom filter claims a key the disk
        // does not hold.
        let k_miss = routing_key(1234);
        store.bloom.add(&store.cipher.digested_key(&k_miss));

        assert!(store.fetch(&k_miss, None).unwrap().is_none());
        assert_eq!(store.bloom_false_positives(), 1);
        assert_eq!(store.misses(), 1);
        store.close();
    }

    #[test]
    fn test_overflow_to_secondary_store() {
        let dir = TempDir::new().unwrap();
        let primary = open_store(dir.path(), "store", 8, test_options(5));
        let secondary = open_store(dir.path(), "cache", 9, test_options(64));

        for i in 0..5 {
            primary
                .put(&TestBlock::new(routing_key(i), i as u8), false, true)
                .unwrap();
        }
        primary.set_alt_store(Arc::clone(&secondary)).unwrap();

        let extra = TestBlock::new(routing_key(50), 5);
        assert_eq!(
            primary.put(&extra, false, true).unwrap(),
            PutOutcome::Inserted
        );

        // The primary is untouched; the block landed in the secondary with
        // the wrong-store bit set.
        for i in 0..5 {
            assert!(primary.fetch(&routing_key(i), None).unwrap().is_some());
        }
        assert_eq!(
            secondary.fetch(&routing_key(50), None).unwrap().unwrap(),
            extra
        );
        let digested = secondary.cipher.digested_key(&routing_key(50));
        let flagged = candidate_offsets(&digested, secondary.max_keys())
            .into_iter()
            .any(|offset| {
                secondary.files.digested_key_at(offset).unwrap() == digested
                    && secondary.files.flags_at(offset).unwrap() & FLAG_WRONG_STORE != 0
            });
        assert!(flagged);

        // The overflow link must stay one-directional.
        assert!(matches!(
            secondary.set_alt_store(Arc::clone(&primary)),
            Err(Error::InvalidInput(_))
        ));

        primary.close();
        secondary.close();
    }

    #[test]
    fn test_concurrent_same_key_inserts_single_copy() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 10, test_options(64));

        let key = routing_key(7);
        let block = TestBlock::new(key, 3);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let block = block.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    store.put(&block, true, true).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let digested = store.cipher.digested_key(&key);
        assert_eq!(slots_holding(&store, &digested), 1);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.fetch(&key, None).unwrap().unwrap(), block);
        store.close();
    }

    #[test]
    fn test_file_sizes_match_capacity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 11, test_options(1024));

        let (meta_len, hd_len) = store.files.lengths().unwrap();
        assert_eq!(meta_len, 1024 * crate::entry::METADATA_LENGTH as u64);
        assert_eq!(hd_len, 1024 * store.files.hd_stride());
        store.close();
    }

    #[test]
    fn test_long_start_required_for_preallocation() {
        let dir = TempDir::new().unwrap();
        let store = SaltedHashStore::open(
            dir.path(),
            "chk",
            TestAdapter,
            Box::new(StdRng::seed_from_u64(12)),
            test_options(256),
        )
        .unwrap();

        // Fresh files are empty: a quick start must defer.
        assert!(store.start(false).unwrap());
        assert!(!store.start(true).unwrap());
        // Starting twice is a no-op.
        assert!(!store.start(true).unwrap());
        store.close();
    }

    #[test]
    fn test_shutdown_silences_public_calls() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 13, test_options(256));
        let block = TestBlock::new(routing_key(1), 1);
        store.put(&block, false, true).unwrap();

        store.close();
        store.close(); // idempotent

        assert!(store.fetch(&routing_key(1), None).unwrap().is_none());
        assert_eq!(
            store.put(&block, false, true).unwrap(),
            PutOutcome::Rejected
        );
        assert!(!store.probably_in_store(&routing_key(1)));
    }

    #[test]
    fn test_stats_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path(), "chk", 14, test_options(256));
            store
                .put(&TestBlock::new(routing_key(1), 1), false, true)
                .unwrap();
            store
                .put(&TestBlock::new(routing_key(2), 2), false, true)
                .unwrap();
            store.fetch(&routing_key(1), None).unwrap();
            store.fetch(&routing_key(3), None).unwrap();
            store.close();
        }

        let store = open_store(dir.path(), "chk", 15, test_options(256));
        let totals = store.total_stats();
        assert_eq!(totals.writes, 2);
        assert_eq!(totals.hits, 1);
        assert_eq!(totals.misses, 1);
        assert_eq!(store.key_count(), 2);
        assert_eq!(store.session_stats(), AccessStats::default());

        // A clean shutdown cleared the dirty bit, so no rebuild is pending.
        assert_eq!(store.config.read().flags & FLAG_REBUILD_BLOOM, 0);

        // Data survives the reopen under the persisted salt.
        assert_eq!(
            store.fetch(&routing_key(1), None).unwrap().unwrap(),
            TestBlock::new(routing_key(1), 1)
        );
        store.close();
    }

    #[test]
    fn test_unclean_shutdown_schedules_rebuild() {
        let dir = TempDir::new().unwrap();
        let block = TestBlock::new(routing_key(1), 1);
        {
            let store = open_store(dir.path(), "chk", 16, parked_cleaner_options(256));
            store.put(&block, false, true).unwrap();
            // Dropped without close(): the dirty bit stays set and the
            // bloom filter is never forced.
        }

        let store = open_store(dir.path(), "chk", 17, test_options(256));
        let (flags, check_bloom) = {
            let config = store.config.read();
            (config.flags, config.check_bloom)
        };
        assert_ne!(flags & FLAG_REBUILD_BLOOM, 0);
        // The filter on disk is missing, so it is distrusted until rebuilt
        // and every fully-written entry is reachable meanwhile.
        assert!(!check_bloom);
        assert_eq!(store.fetch(&routing_key(1), None).unwrap().unwrap(), block);
        store.close();
    }

    #[test]
    fn test_corrupted_config_recovered_as_new_store() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path(), "chk", 18, test_options(256));
            store
                .put(&TestBlock::new(routing_key(1), 1), false, true)
                .unwrap();
            store.close();
        }

        // Truncate the config record below the required fields.
        let config_path = dir.path().join("chk.config");
        fs::write(&config_path, [0u8; 16]).unwrap();

        let store = open_store(dir.path(), "chk", 19, test_options(256));
        // One-shot recovery: new salt, empty metadata, old hd left behind.
        assert_eq!(store.key_count(), 0);
        assert!(store.fetch(&routing_key(1), None).unwrap().is_none());
        assert_eq!(
            store.put(&TestBlock::new(routing_key(2), 2), false, true).unwrap(),
            PutOutcome::Inserted
        );
        assert!(store.fetch(&routing_key(2), None).unwrap().is_some());
        store.close();
    }

    #[test]
    fn test_master_key_store_reopens() {
        let dir = TempDir::new().unwrap();
        let master = [0x42u8; 32];
        let block = TestBlock::new(routing_key(5), 5);
        {
            let store = open_store(
                dir.path(),
                "chk",
                20,
                test_options(256).master_key(master),
            );
            store.put(&block, false, true).unwrap();
            store.close();
        }

        let store = open_store(dir.path(), "chk", 21, test_options(256).master_key(master));
        assert_eq!(store.fetch(&routing_key(5), None).unwrap().unwrap(), block);
        store.close();
    }

    #[test]
    fn test_destroy_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), "chk", 22, test_options(64));
        store
            .put(&TestBlock::new(routing_key(1), 1), false, true)
            .unwrap();
        store.close();
        store.destroy().unwrap();

        for suffix in ["config", "metadata", "hd", "bloom"] {
            assert!(!dir.path().join(format!("chk.{suffix}")).exists());
        }
    }
}
