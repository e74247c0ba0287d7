use std::time::Duration;

pub type RequestId = u64; // request id type, doubles as the arrival sequence

/** Upper bound on requests the stack may hold in flight at once. */
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: u32 = 64;

/** Number of execute passes one tick may spend before yielding. */
pub const DEFAULT_MAX_EXECUTE_PASSES: usize = 8;

/** Transient failures tolerated before a request is failed for good. */
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/** How long the scheduler thread sleeps between polls while I/O is in flight. */
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/** How long the scheduler thread parks when the stack reports idle. */
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(50);

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub const DEFAULT_MAX_READ_SIZE: u64 = 256 * KIB; // reads above this are split
pub const DEFAULT_MAX_SUB_READS: u64 = 4096;
pub const DEFAULT_CACHE_ENTRIES: usize = 256;
pub const DEFAULT_MAX_CACHEABLE_SIZE: u64 = MIB;

pub const DEFAULT_IO_CHANNELS: u32 = 4;
pub const MAX_IO_CHANNELS: u32 = 64;
pub const DEFAULT_MAX_FILE_HANDLES: usize = 32;
pub const DEFAULT_MAX_META_DATA_CACHE_ENTRIES: usize = 64;

/// Added to a read estimate when the head has to move. Typical desktop HDD
/// seek time plus rotational latency at 7200 RPM.
pub const AVERAGE_SEEK_TIME: Duration = Duration::from_millis(12);

/// Number of samples kept by the rolling averages behind completion estimates.
pub const ESTIMATE_WINDOW: usize = 128;
