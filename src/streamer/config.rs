//! Configuration for the streamer and its reference stages.
//!
//! Every struct deserialises from JSON with missing fields filled from
//! `Default`, so a config file only needs to name what it changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::config::{
    DEFAULT_CACHE_ENTRIES, DEFAULT_IDLE_WAIT, DEFAULT_IO_CHANNELS,
    DEFAULT_MAX_CACHEABLE_SIZE, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_EXECUTE_PASSES,
    DEFAULT_MAX_FILE_HANDLES, DEFAULT_MAX_META_DATA_CACHE_ENTRIES, DEFAULT_MAX_READ_SIZE,
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_SUB_READS, DEFAULT_POLL_INTERVAL, ESTIMATE_WINDOW,
    MAX_IO_CHANNELS,
};
use crate::common::exception::ConfigError;

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Scheduler loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Upper bound on `available_slots`; the fold starts here every tick
    pub max_concurrent_requests: u32,
    /// Execute passes one tick may run before yielding
    pub max_execute_passes: usize,
    /// Sleep between ticks while work is in flight
    pub poll_interval_ms: u64,
    /// Sleep between ticks while idle, unless woken by a submission
    pub idle_wait_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_execute_passes: DEFAULT_MAX_EXECUTE_PASSES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            idle_wait_ms: DEFAULT_IDLE_WAIT.as_millis() as u64,
        }
    }
}

impl StreamerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_requests == 0 || self.max_concurrent_requests > i32::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent_requests must be in 1..={}, got {}",
                i32::MAX,
                self.max_concurrent_requests
            )));
        }
        if self.max_execute_passes == 0 {
            return Err(ConfigError::Invalid(
                "max_execute_passes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_slots(&self) -> i32 {
        self.max_concurrent_requests.min(i32::MAX as u32) as i32
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSplitterConfig {
    pub name: String,
    /// Reads larger than this are split at multiples of it
    pub max_read_size: u64,
    /// Reads needing more sub-reads than this are failed as too large
    pub max_sub_reads: u64,
}

impl Default for ReadSplitterConfig {
    fn default() -> Self {
        Self {
            name: "Read splitter".to_string(),
            max_read_size: DEFAULT_MAX_READ_SIZE,
            max_sub_reads: DEFAULT_MAX_SUB_READS,
        }
    }
}

impl ReadSplitterConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_read_size == 0 {
            return Err(ConfigError::Invalid("max_read_size must be non-zero".to_string()));
        }
        if self.max_sub_reads == 0 {
            return Err(ConfigError::Invalid("max_sub_reads must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadCacheConfig {
    pub name: String,
    /// Number of reads kept resident
    pub capacity: usize,
    /// Reads larger than this bypass the cache
    pub max_cacheable_size: u64,
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            name: "Read cache".to_string(),
            capacity: DEFAULT_CACHE_ENTRIES,
            max_cacheable_size: DEFAULT_MAX_CACHEABLE_SIZE,
        }
    }
}

impl ReadCacheConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("cache capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageDriveConfig {
    pub name: String,
    /// Parallel I/O operations the device accepts
    pub io_channels: u32,
    /// Extra requests admitted beyond the channel count. Negative values
    /// reserve channels.
    pub overcommit: i32,
    /// Transient failures tolerated per request
    pub max_retries: u32,
    /// Samples kept by the read throughput averages
    pub estimate_window: usize,
    /// Path prefixes this drive serves. Requests for other paths are passed
    /// on to the next stage. Empty serves every path.
    pub drive_paths: Vec<PathBuf>,
    /// Files remembered as open, used to price file switches
    pub max_file_handles: usize,
    /// File sizes remembered for exists and metadata queries
    pub max_meta_data_cache_entries: usize,
    /// Adds a seek penalty to reads that don't continue the previous one
    pub has_seek_penalty: bool,
}

impl Default for StorageDriveConfig {
    fn default() -> Self {
        Self {
            name: "Storage drive".to_string(),
            io_channels: DEFAULT_IO_CHANNELS,
            overcommit: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            estimate_window: ESTIMATE_WINDOW,
            drive_paths: Vec::new(),
            max_file_handles: DEFAULT_MAX_FILE_HANDLES,
            max_meta_data_cache_entries: DEFAULT_MAX_META_DATA_CACHE_ENTRIES,
            has_seek_penalty: true,
        }
    }
}

impl StorageDriveConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config: Self = load_json(path.as_ref())?;
        config.validate()?;
        config.normalize();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_channels > MAX_IO_CHANNELS {
            return Err(ConfigError::Invalid(format!(
                "io_channels must be at most {}, got {}",
                MAX_IO_CHANNELS, self.io_channels
            )));
        }
        if self.estimate_window == 0 {
            return Err(ConfigError::Invalid("estimate_window must be non-zero".to_string()));
        }
        if self.max_file_handles == 0 {
            return Err(ConfigError::Invalid("max_file_handles must be non-zero".to_string()));
        }
        Ok(())
    }

    /// True if `path` lies under one of `drive_paths`, or no paths are set
    pub fn services(&self, path: &Path) -> bool {
        self.drive_paths.is_empty() || self.drive_paths.iter().any(|root| path.starts_with(root))
    }

    /// Falls back to the default channel count when none is given, and raises
    /// `overcommit` so that at least one request can always be admitted.
    pub fn normalize(&mut self) {
        if self.io_channels == 0 {
            warn!(
                "'{}' configured with 0 I/O channels, using {}",
                self.name, DEFAULT_IO_CHANNELS
            );
            self.io_channels = DEFAULT_IO_CHANNELS;
        }
        let channels = self.io_channels as i32;
        if channels + self.overcommit < 1 {
            warn!(
                "'{}' overcommit of {} leaves no usable slots, clamping to {}",
                self.name,
                self.overcommit,
                1 - channels
            );
            self.overcommit = 1 - channels;
        }
    }
}
