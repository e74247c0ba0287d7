//! Diagnostic counters reported by stages.
//!
//! Statistics are for profiling only. Nothing in the scheduler reads them back
//! when making decisions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatisticValue {
    Integer(i64),
    Float(f64),
    ByteSize(u64),
    BytesPerSecond(f64),
    Time(Duration),
    Percentage(f64),
    Boolean(bool),
    Text(String),
}

impl fmt::Display for StatisticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:.3}", v),
            Self::ByteSize(v) => write!(f, "{} B", v),
            Self::BytesPerSecond(v) => write!(f, "{:.1} MB/s", v / (1024.0 * 1024.0)),
            Self::Time(v) => write!(f, "{:?}", v),
            Self::Percentage(v) => write!(f, "{:.1}%", v * 100.0),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A named counter, owned by the stage (or context) that reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistic {
    pub owner: String,
    pub name: String,
    pub value: StatisticValue,
}

impl Statistic {
    pub fn new(owner: &str, name: &str, value: StatisticValue) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            value,
        }
    }

    pub fn integer(owner: &str, name: &str, value: i64) -> Self {
        Self::new(owner, name, StatisticValue::Integer(value))
    }

    pub fn byte_size(owner: &str, name: &str, value: u64) -> Self {
        Self::new(owner, name, StatisticValue::ByteSize(value))
    }

    pub fn bytes_per_second(owner: &str, name: &str, value: f64) -> Self {
        Self::new(owner, name, StatisticValue::BytesPerSecond(value))
    }

    pub fn time(owner: &str, name: &str, value: Duration) -> Self {
        Self::new(owner, name, StatisticValue::Time(value))
    }

    pub fn percentage(owner: &str, name: &str, value: f64) -> Self {
        Self::new(owner, name, StatisticValue::Percentage(value))
    }

    pub fn boolean(owner: &str, name: &str, value: bool) -> Self {
        Self::new(owner, name, StatisticValue::Boolean(value))
    }

    pub fn text(owner: &str, name: &str, value: impl Into<String>) -> Self {
        Self::new(owner, name, StatisticValue::Text(value.into()))
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.owner, self.name, self.value)
    }
}

/// Finds a statistic by owner and name
pub fn find<'a>(statistics: &'a [Statistic], owner: &str, name: &str) -> Option<&'a Statistic> {
    statistics
        .iter()
        .find(|s| s.owner == owner && s.name == name)
}

/// Rolling window over the most recent samples, keeping a running total so
/// averages are O(1).
#[derive(Debug, Clone)]
pub struct AverageWindow {
    samples: VecDeque<u64>,
    total: u128,
    capacity: usize,
}

impl AverageWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            total: 0,
            capacity: capacity.max(1),
        }
    }

    /// Window pre-seeded with one sample, so divisions never see zero
    pub fn seeded(capacity: usize, seed: u64) -> Self {
        let mut window = Self::new(capacity);
        window.push(seed);
        window
    }

    pub fn push(&mut self, sample: u64) {
        self.samples.push_back(sample);
        self.total += sample as u128;
        while self.samples.len() > self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.total -= evicted as u128;
            }
        }
    }

    /// Sum of the samples in the window, saturating at `u64::MAX`
    pub fn total(&self) -> u64 {
        self.total.min(u64::MAX as u128) as u64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            (self.total / self.samples.len() as u128) as u64
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.samples.iter().copied().min()
    }

    pub fn max(&self) -> Option<u64> {
        self.samples.iter().copied().max()
    }
}

/// Lock-free request outcome counters
#[derive(Debug, Default)]
pub struct RequestCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl RequestCounters {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Requests submitted but not yet settled
    pub fn outstanding(&self) -> u64 {
        self.submitted().saturating_sub(
            self.completed() + self.failed() + self.cancelled() + self.timed_out(),
        )
    }

    pub fn collect(&self, owner: &str, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::integer(owner, "Submitted", self.submitted() as i64));
        statistics.push(Statistic::integer(owner, "Completed", self.completed() as i64));
        statistics.push(Statistic::integer(owner, "Failed", self.failed() as i64));
        statistics.push(Statistic::integer(owner, "Cancelled", self.cancelled() as i64));
        statistics.push(Statistic::integer(owner, "Timed out", self.timed_out() as i64));
        statistics.push(Statistic::integer(owner, "Outstanding", self.outstanding() as i64));
    }
}
