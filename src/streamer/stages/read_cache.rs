//! LRU cache of completed reads.
//!
//! | Request              | Behaviour                                           |
//! |----------------------|-----------------------------------------------------|
//! | `Read`, cached       | served during prepare, never reaches the next stage |
//! | `Read`, not cached   | child read sent down; its hook fills the cache      |
//! | `Read`, too large    | forwarded untouched                                 |
//! | `Flush { path }`     | evicts every entry for `path`, then forwards        |
//! | `FlushAll`           | clears, then forwards                               |
//! | anything else        | forwarded untouched                                 |
//!
//! The cache itself sits behind its own lock because hooks fill it from the
//! finalisation pass, outside any stage lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::time::Timestamp;
use crate::streamer::cache::{CoreCache, LRUCache, MutableCache};
use crate::streamer::config::ReadCacheConfig;
use crate::streamer::request::{CompletionHook, FileRequest, RequestCommand};
use crate::streamer::request_status::RequestReply;
use crate::streamer::stage::{StageLink, StreamStage};
use crate::streamer::statistics::{AverageWindow, Statistic};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

type SharedCache = Arc<Mutex<LRUCache<CacheKey, Arc<Vec<u8>>>>>;

pub struct ReadCache {
    link: StageLink,
    max_cacheable_size: u64,
    cache: SharedCache,
    /// Nanoseconds spent copying into the cache, per fill
    fill_times: Arc<Mutex<AverageWindow>>,
    hits: u64,
    misses: u64,
    flushes: u64,
}

impl ReadCache {
    pub fn new(config: &ReadCacheConfig) -> Self {
        Self {
            link: StageLink::new(config.name.clone()),
            max_cacheable_size: config.max_cacheable_size,
            cache: Arc::new(Mutex::new(LRUCache::new(config.capacity))),
            fill_times: Arc::new(Mutex::new(AverageWindow::seeded(64, 1))),
            hits: 0,
            misses: 0,
            flushes: 0,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn contains(&self, path: impl Into<PathBuf>, offset: u64, size: u64) -> bool {
        self.cache.lock().contains(&CacheKey {
            path: path.into(),
            offset,
            size,
        })
    }

    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    fn fill_cost(&self) -> Duration {
        Duration::from_nanos(self.fill_times.lock().average())
    }

    fn is_cacheable(&self, request: &FileRequest) -> bool {
        matches!(request.command(), RequestCommand::Read { size, .. } if *size <= self.max_cacheable_size)
    }

    /// Serves a read from the cache. Returns false on a miss.
    fn try_serve(&mut self, request: &Arc<FileRequest>, key: &CacheKey) -> bool {
        let Some(data) = self.cache.lock().get(key).cloned() else {
            return false;
        };
        let Some(context) = self.link.context() else {
            return false;
        };
        if let Some(output) = request.output() {
            let mut output = output.lock();
            output.clear();
            output.extend_from_slice(&data);
        }
        self.hits += 1;
        trace!("Cache hit for request {}", request.id());
        context.complete_request(request, RequestReply::BytesRead(data.len() as u64));
        true
    }

    fn fill_hook(&self, key: CacheKey) -> CompletionHook {
        let cache = Arc::clone(&self.cache);
        let fill_times = Arc::clone(&self.fill_times);
        Box::new(move |child: &FileRequest| {
            if !child.status().is_success() {
                return;
            }
            let Some(output) = child.output() else {
                return;
            };
            let started = Instant::now();
            let data = Arc::new(output.lock().clone());
            cache.lock().insert(key, data);
            fill_times
                .lock()
                .push(started.elapsed().as_nanos().max(1) as u64);
        })
    }

    fn prepare_read(&mut self, request: Arc<FileRequest>, key: CacheKey) {
        if self.try_serve(&request, &key) {
            return;
        }
        self.misses += 1;
        let Some(context) = self.link.context().cloned() else {
            self.link.forward_prepare(request);
            return;
        };
        let child = context.create_internal_request(
            &request,
            request.command().clone(),
            request.output().cloned(),
            Some(self.fill_hook(key)),
        );
        self.link.forward_prepare(child);
    }
}

impl StreamStage for ReadCache {
    fn link(&self) -> &StageLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StageLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        match request.command() {
            RequestCommand::Read { path, offset, size }
                if *size <= self.max_cacheable_size && request.output().is_some() =>
            {
                let key = CacheKey {
                    path: path.clone(),
                    offset: *offset,
                    size: *size,
                };
                self.prepare_read(request, key);
            }
            RequestCommand::Flush { path } => {
                let evicted = self.cache.lock().retain(|key, _| key.path != *path);
                self.flushes += 1;
                debug!("Flushed {} cached reads of {}", evicted, path.display());
                self.link.forward_prepare(request);
            }
            RequestCommand::FlushAll => {
                self.cache.lock().clear();
                self.flushes += 1;
                debug!("Flushed all cached reads");
                self.link.forward_prepare(request);
            }
            _ => self.link.forward_prepare(request),
        }
    }

    /// Every cacheable read still waiting will pay for one cache fill
    fn update_completion_estimates(
        &mut self,
        now: Timestamp,
        internal_pending: &mut Vec<Arc<FileRequest>>,
        pending: &[Arc<FileRequest>],
    ) {
        self.link.forward_estimates(now, internal_pending, pending);

        let cost = self.fill_cost();
        for request in internal_pending.iter().chain(pending) {
            if self.is_cacheable(request)
                && let Some(estimate) = request.estimated_completion()
            {
                request.set_estimated_completion(estimate + cost);
            }
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let name = self.link.name();
        let cache = self.cache.lock();
        statistics.push(Statistic::integer(name, "Entries", cache.len() as i64));
        statistics.push(Statistic::integer(name, "Capacity", cache.capacity() as i64));
        drop(cache);
        statistics.push(Statistic::integer(name, "Hits", self.hits as i64));
        statistics.push(Statistic::integer(name, "Misses", self.misses as i64));
        statistics.push(Statistic::percentage(name, "Hit ratio", self.hit_ratio()));
        statistics.push(Statistic::integer(name, "Flushes", self.flushes as i64));
        statistics.push(Statistic::time(name, "Fill time", self.fill_cost()));
        self.link.forward_statistics(statistics);
    }
}
