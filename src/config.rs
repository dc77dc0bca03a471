use std::time::Duration;

/// Runtime options for a salted-hash store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Target capacity in slots (default: 32768)
    pub max_keys: u64,

    /// Bloom filter size in bits (default: 1 bit per 2 slots of capacity,
    /// rounded up to a byte; set explicitly for real deployments)
    pub bloom_filter_size: u64,

    /// Use 8-bit counting cells so keys can be removed (default: true)
    pub counting_bloom: bool,

    /// Fill the header+data file with pseudorandom bytes on growth so the
    /// on-disk footprint never changes with use (default: true)
    pub preallocate: bool,

    /// Finish any in-progress resize synchronously inside `open` instead of
    /// leaving it to the cleaner (default: false)
    pub resize_on_start: bool,

    /// When set, the salt is stored AES-256-encrypted under this key
    pub master_key: Option<[u8; 32]>,

    /// Cleaner configuration
    pub cleaner: CleanerOptions,
}

#[derive(Debug, Clone)]
pub struct CleanerOptions {
    /// How often the cleaner sweeps (default: 5 min)
    pub period: Duration,

    /// Randomize the first sweep within `period/2 + rand*period` after start
    /// so several stores opened together do not sweep together (default: true)
    pub jitter: bool,

    /// Pause between slot batches of a periodic sweep, yielding the disk to
    /// foreground traffic (default: 100 ms)
    pub batch_sleep: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_keys: 32 * 1024,
            bloom_filter_size: 16 * 1024,
            counting_bloom: true,
            preallocate: true,
            resize_on_start: false,
            master_key: None,
            cleaner: CleanerOptions::default(),
        }
    }
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5 * 60),
            jitter: true,
            batch_sleep: Duration::from_millis(100),
        }
    }
}

impl StoreOptions {
    /// Create options with the given capacity
    pub fn new(max_keys: u64) -> Self {
        Self {
            max_keys,
            ..Default::default()
        }
    }

    /// Set bloom filter size in bits
    pub fn bloom_filter_size(mut self, bits: u64) -> Self {
        self.bloom_filter_size = bits;
        self
    }

    /// Use counting (removable) bloom cells
    pub fn counting_bloom(mut self, counting: bool) -> Self {
        self.counting_bloom = counting;
        self
    }

    /// Enable pseudorandom preallocation of the header+data file
    pub fn preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = preallocate;
        self
    }

    /// Complete a pending resize inside `open`
    pub fn resize_on_start(mut self, resize: bool) -> Self {
        self.resize_on_start = resize;
        self
    }

    /// Encrypt the persisted salt under a master key
    pub fn master_key(mut self, key: [u8; 32]) -> Self {
        self.master_key = Some(key);
        self
    }

    /// Configure cleaner settings
    pub fn cleaner(mut self, cleaner: CleanerOptions) -> Self {
        self.cleaner = cleaner;
        self
    }
}

impl CleanerOptions {
    /// Set sweep period
    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Enable or disable first-sweep jitter
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the pause between periodic-sweep batches
    pub fn batch_sleep(mut self, sleep: Duration) -> Self {
        self.batch_sleep = sleep;
        self
    }
}
