//! # Storage Drive
//!
//! Terminal stage that performs file I/O. Operations run on a tokio runtime;
//! results come back over a channel that `execute_requests` drains, so the
//! scheduler thread never blocks on the device.
//!
//! ## Flow
//!
//! ```text
//!   prepare ──► not under drive_paths      → next stage
//!               exists / metadata cached   → complete
//!               flush                      → evict caches, complete or forward
//!               otherwise                  → context prepared queue
//!                      │ (admitted while slots > 0)
//!                      ▼
//!   queue   ──► pending_reads / pending_requests   (priority, then arrival)
//!                      │ (while active < io_channels)
//!                      ▼
//!   execute ──► runtime.spawn(backend op) ──► completions channel
//!                                                   │
//!               next execute: drain ◄───────────────┘
//!                 ok        → fill output, complete
//!                 transient → requeue (until max_retries)
//!                 permanent → fail
//!               then: cancelled / expired requests are settled,
//!                     in-flight ones aborted and their channel freed
//! ```
//!
//! Every operation is spawned behind a supervising task, so a backend that
//! panics or is aborted still produces a completion and never leaves a
//! channel occupied.
//!
//! ## Slots
//!
//! `io_channels + overcommit - pending_reads - pending_requests - active`.
//! Overcommit keeps a few requests queued so a channel never sits empty
//! between ticks.
//!
//! ## Estimates
//!
//! Read cost is `size * total_read_time / total_bytes_read` over a rolling
//! window seeded with one byte per microsecond. A read of a file that isn't
//! the previous one and isn't among the remembered open files also pays the
//! average open time, and a read that doesn't continue where the previous
//! one stopped pays [`AVERAGE_SEEK_TIME`] when `has_seek_penalty` is set.
//! Active operations finish at `start + cost`, with the open and seek time
//! priced in when they started; the earliest of those (or
//! `now` if a channel is free) starts a sequential timeline that the drive's
//! own queue, then requests held above (in reverse), then the prepared range
//! are laid along.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::common::config::{AVERAGE_SEEK_TIME, DEFAULT_MAX_FILE_HANDLES, RequestId};
use crate::common::exception::{RequestError, is_transient};
use crate::common::time::Timestamp;
use crate::streamer::cache::{CoreCache, LRUCache, MutableCache};
use crate::streamer::config::StorageDriveConfig;
use crate::streamer::context::StreamerContext;
use crate::streamer::request::{FileRequest, RequestCommand, enqueue_by_priority};
use crate::streamer::request_status::{RequestReply, RequestStatus};
use crate::streamer::stage::{StageLink, Status, StreamStage};
use crate::streamer::statistics::{AverageWindow, Statistic};

pub type DriveFuture<T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'static>>;

/// Device operations used by the drive. Implementations must not block the
/// calling thread; the returned futures run on the drive's runtime.
pub trait DriveBackend: Send + Sync + 'static {
    /// Opens `path` ahead of its first read. Backends that keep no handles
    /// have nothing to do.
    fn open(&self, _path: PathBuf) -> DriveFuture<()> {
        Box::pin(async { Ok(()) })
    }

    fn read(&self, path: PathBuf, offset: u64, size: u64) -> DriveFuture<Vec<u8>>;

    fn exists(&self, path: PathBuf) -> DriveFuture<bool>;

    fn file_size(&self, path: PathBuf) -> DriveFuture<u64>;

    /// Releases anything held for `path`
    fn flush(&self, _path: &Path) {}

    fn flush_all(&self) {}
}

type SharedFile = Arc<tokio::sync::Mutex<File>>;

/// Reads from the local file system through `tokio::fs`, keeping recently
/// used files open between reads.
#[derive(Debug, Clone)]
pub struct LocalFileBackend {
    handles: Arc<Mutex<LRUCache<PathBuf, SharedFile>>>,
}

impl LocalFileBackend {
    pub fn new(max_file_handles: usize) -> Self {
        Self {
            handles: Arc::new(Mutex::new(LRUCache::new(max_file_handles))),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for LocalFileBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_HANDLES)
    }
}

async fn cached_handle(
    handles: &Mutex<LRUCache<PathBuf, SharedFile>>,
    path: &Path,
) -> io::Result<SharedFile> {
    let key = path.to_path_buf();
    let cached = handles.lock().get(&key).cloned();
    if let Some(file) = cached {
        return Ok(file);
    }
    let file = Arc::new(tokio::sync::Mutex::new(File::open(path).await?));
    handles.lock().insert(key, Arc::clone(&file));
    Ok(file)
}

fn out_of_memory(size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::OutOfMemory,
        format!("cannot allocate {} bytes for a read", size),
    )
}

impl DriveBackend for LocalFileBackend {
    fn open(&self, path: PathBuf) -> DriveFuture<()> {
        let handles = Arc::clone(&self.handles);
        Box::pin(async move { cached_handle(&handles, &path).await.map(|_| ()) })
    }

    fn read(&self, path: PathBuf, offset: u64, size: u64) -> DriveFuture<Vec<u8>> {
        let handles = Arc::clone(&self.handles);
        Box::pin(async move {
            let file = cached_handle(&handles, &path).await?;
            let mut file = file.lock().await;

            // Nothing is allocated for a range the file can't satisfy.
            let len = file.metadata().await?.len();
            if offset.checked_add(size).is_none_or(|end| end > len) {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} bytes at offset {} run past the end of a {} byte file",
                        size, offset, len
                    ),
                ));
            }
            let bytes = usize::try_from(size).map_err(|_| out_of_memory(size))?;
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(bytes)
                .map_err(|_| out_of_memory(size))?;
            buffer.resize(bytes, 0);

            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buffer).await?;
            Ok(buffer)
        })
    }

    fn exists(&self, path: PathBuf) -> DriveFuture<bool> {
        Box::pin(async move { tokio::fs::try_exists(&path).await })
    }

    fn file_size(&self, path: PathBuf) -> DriveFuture<u64> {
        Box::pin(async move { Ok(tokio::fs::metadata(&path).await?.len()) })
    }

    fn flush(&self, path: &Path) {
        self.handles.lock().remove(&path.to_path_buf());
    }

    fn flush_all(&self) {
        self.handles.lock().clear();
    }
}

enum DriveOutput {
    Data(Vec<u8>),
    Exists(bool),
    Size(u64),
}

/// What a spawned operation reports back
struct Finished {
    outcome: io::Result<DriveOutput>,
    /// Time spent opening the file, if the operation had to
    open_time: Option<Duration>,
}

impl Finished {
    fn new(outcome: io::Result<DriveOutput>) -> Self {
        Self {
            outcome,
            open_time: None,
        }
    }
}

type Operation = Pin<Box<dyn Future<Output = Finished> + Send + 'static>>;

struct DriveCompletion {
    id: RequestId,
    finished: Finished,
    elapsed: Duration,
}

struct ActiveOperation {
    request: Arc<FileRequest>,
    started: Timestamp,
    /// Bytes requested, for reads
    read_size: Option<u64>,
    /// Open and seek time priced in when the read started
    positioning: Duration,
    task: AbortHandle,
}

#[derive(Debug, Default)]
struct DriveCounters {
    reads: u64,
    reads_started: u64,
    bytes_read: u64,
    exists_checks: u64,
    meta_data_queries: u64,
    meta_data_cache_hits: u64,
    file_switches: u64,
    seeks: u64,
    retries: u64,
    failures: u64,
    aborted: u64,
    forwarded: u64,
    flushes: u64,
}

pub struct StorageDrive {
    link: StageLink,
    config: StorageDriveConfig,
    runtime: Handle,
    backend: Arc<dyn DriveBackend>,
    pending_reads: VecDeque<Arc<FileRequest>>,
    pending_requests: VecDeque<Arc<FileRequest>>,
    active: HashMap<RequestId, ActiveOperation>,
    completions_tx: Sender<DriveCompletion>,
    completions_rx: Receiver<DriveCompletion>,
    /// Files known to be open, with the time they were last read
    file_handles: LRUCache<PathBuf, Timestamp>,
    /// File sizes from earlier metadata queries
    meta_data: LRUCache<PathBuf, u64>,
    /// File and end offset of the most recently started read
    last_read: Option<(PathBuf, u64)>,
    read_sizes: AverageWindow,
    read_times_us: AverageWindow,
    request_times_us: AverageWindow,
    open_times_us: AverageWindow,
    counters: DriveCounters,
}

impl StorageDrive {
    /// Drive over the local file system
    pub fn new(config: StorageDriveConfig, runtime: Handle) -> Self {
        let backend = Arc::new(LocalFileBackend::new(config.max_file_handles));
        Self::with_backend(config, runtime, backend)
    }

    pub fn with_backend(
        mut config: StorageDriveConfig,
        runtime: Handle,
        backend: Arc<dyn DriveBackend>,
    ) -> Self {
        config.normalize();
        let (completions_tx, completions_rx) = unbounded();
        let window = config.estimate_window.max(1);
        info!(
            "Storage drive '{}' with {} I/O channels, overcommit {}, serving {}",
            config.name,
            config.io_channels,
            config.overcommit,
            if config.drive_paths.is_empty() {
                "all paths".to_string()
            } else {
                format!("{:?}", config.drive_paths)
            }
        );
        Self {
            link: StageLink::new(config.name.clone()),
            runtime,
            backend,
            pending_reads: VecDeque::new(),
            pending_requests: VecDeque::new(),
            active: HashMap::new(),
            completions_tx,
            completions_rx,
            file_handles: LRUCache::new(config.max_file_handles),
            meta_data: LRUCache::new(config.max_meta_data_cache_entries),
            last_read: None,
            read_sizes: AverageWindow::seeded(window, 1),
            read_times_us: AverageWindow::seeded(window, 1),
            request_times_us: AverageWindow::seeded(window, 1),
            open_times_us: AverageWindow::new(window),
            counters: DriveCounters::default(),
            config,
        }
    }

    pub fn config(&self) -> &StorageDriveConfig {
        &self.config
    }

    pub fn available_slots(&self) -> i32 {
        let queued = self.pending_reads.len() + self.pending_requests.len() + self.active.len();
        self.config.io_channels as i32 + self.config.overcommit - queued as i32
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_reads.len() + self.pending_requests.len()
    }

    pub fn cached_file_handles(&self) -> usize {
        self.file_handles.len()
    }

    pub fn cached_meta_data(&self) -> usize {
        self.meta_data.len()
    }

    fn read_cost(&self, size: u64) -> Duration {
        let micros = size as u128 * self.read_times_us.total() as u128
            / self.read_sizes.total().max(1) as u128;
        Duration::from_micros(micros.min(u64::MAX as u128) as u64)
    }

    fn request_cost(&self) -> Duration {
        Duration::from_micros(self.request_times_us.average())
    }

    /// Open and seek time a read of `path` at `offset` pays when it follows
    /// a read that ended at `head`
    fn positioning_cost(&self, head: Option<(&Path, u64)>, path: &Path, offset: u64) -> Duration {
        let mut cost = Duration::ZERO;
        let same_file = head.is_some_and(|(file, _)| file == path);
        if !same_file && !self.file_handles.contains(&path.to_path_buf()) {
            cost += Duration::from_micros(self.open_times_us.average());
        }
        let sequential = head.is_some_and(|(file, end)| file == path && end == offset);
        if self.config.has_seek_penalty && !sequential {
            cost += AVERAGE_SEEK_TIME;
        }
        cost
    }

    fn bytes_per_second(&self) -> f64 {
        let seconds = self.read_times_us.total() as f64 / 1_000_000.0;
        if seconds <= 0.0 {
            0.0
        } else {
            self.read_sizes.total() as f64 / seconds
        }
    }

    fn ratio(&self, count: u64) -> f64 {
        if self.counters.reads_started == 0 {
            0.0
        } else {
            count as f64 / self.counters.reads_started as f64
        }
    }

    /// Answers exists and metadata queries from what earlier requests learnt
    fn cached_reply(&mut self, command: &RequestCommand) -> Option<RequestReply> {
        match command {
            RequestCommand::FileMetaData { path } => {
                self.meta_data.get(path).map(|size| RequestReply::FileSize(*size))
            }
            RequestCommand::FileExists { path } => (self.meta_data.contains(path)
                || self.file_handles.contains(path))
            .then_some(RequestReply::Exists(true)),
            _ => None,
        }
    }

    fn flush_cache(&mut self, path: &Path) {
        let key = path.to_path_buf();
        self.file_handles.remove(&key);
        self.meta_data.remove(&key);
        self.backend.flush(path);
        if self.last_read.as_ref().is_some_and(|(file, _)| file == path) {
            self.last_read = None;
        }
        debug!("Drive '{}' flushed {}", self.link.name(), path.display());
    }

    fn flush_entire_cache(&mut self) {
        self.file_handles.clear();
        self.meta_data.clear();
        self.backend.flush_all();
        self.last_read = None;
        debug!("Drive '{}' flushed all cached files", self.link.name());
    }

    /// Evicts what the drive holds for a flush, then lets the next stage see
    /// it too. The last stage completes it.
    fn handle_flush(&mut self, request: Arc<FileRequest>) {
        match request.command() {
            RequestCommand::Flush { path } => self.flush_cache(path),
            RequestCommand::FlushAll => self.flush_entire_cache(),
            _ => return,
        }
        self.counters.flushes += 1;
        if self.link.next().is_some() {
            self.link.forward_prepare(request);
        } else if let Some(context) = self.link.context() {
            context.complete_request(&request, RequestReply::Done);
        }
    }

    /// Next request to start: the better of the two queue fronts, metadata
    /// requests winning ties since they are cheap.
    fn pop_next(&mut self) -> Option<Arc<FileRequest>> {
        let take_request = match (self.pending_requests.front(), self.pending_reads.front()) {
            (Some(request), Some(read)) => request.priority() >= read.priority(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if take_request {
            self.pending_requests.pop_front()
        } else {
            self.pending_reads.pop_front()
        }
    }

    fn operation(&self, command: &RequestCommand) -> Option<Operation> {
        let backend = Arc::clone(&self.backend);
        let operation: Operation = match command {
            RequestCommand::Read { path, offset, size } => {
                let needs_open = !self.file_handles.contains(path);
                let (path, offset, size) = (path.clone(), *offset, *size);
                Box::pin(async move {
                    let mut open_time = None;
                    if needs_open {
                        let begin = Instant::now();
                        if let Err(error) = backend.open(path.clone()).await {
                            return Finished::new(Err(error));
                        }
                        open_time = Some(begin.elapsed());
                    }
                    Finished {
                        outcome: backend.read(path, offset, size).await.map(DriveOutput::Data),
                        open_time,
                    }
                })
            }
            RequestCommand::FileExists { path } => {
                let path = path.clone();
                Box::pin(async move {
                    Finished::new(backend.exists(path).await.map(DriveOutput::Exists))
                })
            }
            RequestCommand::FileMetaData { path } => {
                let path = path.clone();
                Box::pin(async move {
                    Finished::new(backend.file_size(path).await.map(DriveOutput::Size))
                })
            }
            RequestCommand::Flush { .. } | RequestCommand::FlushAll => return None,
        };
        Some(operation)
    }

    fn track_read_position(&mut self, path: &Path, offset: u64, size: u64) {
        self.counters.reads_started += 1;
        match &self.last_read {
            Some((file, end)) if file == path => {
                if *end != offset {
                    self.counters.seeks += 1;
                }
            }
            Some(_) => {
                self.counters.file_switches += 1;
                self.counters.seeks += 1;
            }
            None => {}
        }
        self.last_read = Some((path.to_path_buf(), offset.saturating_add(size)));
    }

    fn start(&mut self, request: Arc<FileRequest>) {
        let Some(operation) = self.operation(request.command()) else {
            self.handle_flush(request);
            return;
        };
        let (read_size, positioning) = match request.command() {
            RequestCommand::Read { path, offset, size } => {
                let head = self.last_read.as_ref().map(|(file, end)| (file.as_path(), *end));
                let positioning = self.positioning_cost(head, path, *offset);
                self.track_read_position(path, *offset, *size);
                (Some(*size), positioning)
            }
            _ => (None, Duration::ZERO),
        };

        let started = self
            .link
            .context()
            .map(|context| context.now())
            .unwrap_or_else(Instant::now);
        request.advance(RequestStatus::Executing);
        trace!(
            "Drive '{}' starting request {} ({})",
            self.link.name(),
            request.id(),
            request.command().name()
        );

        let id = request.id();
        let sender = self.completions_tx.clone();
        let task = self.runtime.spawn(operation);
        let abort = task.abort_handle();
        // A panicking or aborted operation still reports back.
        self.runtime.spawn(async move {
            let begin = Instant::now();
            let finished = match task.await {
                Ok(finished) => finished,
                Err(error) => Finished::new(Err(io::Error::other(error.to_string()))),
            };
            // The drive may have been dropped; nothing left to notify.
            let _ = sender.send(DriveCompletion {
                id,
                finished,
                elapsed: begin.elapsed(),
            });
        });

        self.active.insert(
            id,
            ActiveOperation {
                request,
                started,
                read_size,
                positioning,
                task: abort,
            },
        );
    }

    fn requeue(&mut self, request: Arc<FileRequest>) {
        request.advance(RequestStatus::Queued);
        match request.command() {
            RequestCommand::Read { .. } => enqueue_by_priority(&mut self.pending_reads, request),
            _ => enqueue_by_priority(&mut self.pending_requests, request),
        }
    }

    fn finish(&mut self, completion: DriveCompletion) {
        let Some(active) = self.active.remove(&completion.id) else {
            trace!(
                "Drive '{}' dropped a late result for request {}",
                self.link.name(),
                completion.id
            );
            return;
        };
        let Some(context) = self.link.context().cloned() else {
            return;
        };
        let request = active.request;
        if context.reject_if_abandoned(&request) {
            return;
        }

        let Finished { outcome, open_time } = completion.finished;
        let open_micros = open_time.map_or(0, |open| open.as_micros() as u64);
        if open_time.is_some() {
            self.open_times_us.push(open_micros.max(1));
        }
        let micros = (completion.elapsed.as_micros() as u64)
            .saturating_sub(open_micros)
            .max(1);

        match outcome {
            Ok(DriveOutput::Data(data)) => {
                let read = data.len() as u64;
                if let Some(path) = request.command().path() {
                    self.file_handles.insert(path.to_path_buf(), context.now());
                }
                if let Some(output) = request.output() {
                    let mut output = output.lock();
                    output.clear();
                    output.extend_from_slice(&data);
                }
                self.read_sizes.push(read.max(1));
                self.read_times_us.push(micros);
                self.counters.reads += 1;
                self.counters.bytes_read += read;
                context.complete_request(&request, RequestReply::BytesRead(read));
            }
            Ok(DriveOutput::Exists(exists)) => {
                self.request_times_us.push(micros);
                self.counters.exists_checks += 1;
                context.complete_request(&request, RequestReply::Exists(exists));
            }
            Ok(DriveOutput::Size(size)) => {
                if let Some(path) = request.command().path() {
                    self.meta_data.insert(path.to_path_buf(), size);
                }
                self.request_times_us.push(micros);
                self.counters.meta_data_queries += 1;
                context.complete_request(&request, RequestReply::FileSize(size));
            }
            Err(error) if is_transient(&error) => {
                let attempts = request.requeue();
                self.counters.retries += 1;
                if attempts > self.config.max_retries {
                    self.counters.failures += 1;
                    context.fail_request(
                        &request,
                        RequestError::RetriesExhausted {
                            attempts,
                            reason: error.to_string(),
                        },
                    );
                } else {
                    warn!(
                        "Drive '{}' retrying request {} ({}/{}): {}",
                        self.link.name(),
                        request.id(),
                        attempts,
                        self.config.max_retries,
                        error
                    );
                    self.requeue(request);
                }
            }
            Err(error) => {
                self.counters.failures += 1;
                let (path, offset, size) = match request.command() {
                    RequestCommand::Read { path, offset, size } => (path.clone(), *offset, *size),
                    command => (
                        command.path().map(|path| path.to_path_buf()).unwrap_or_default(),
                        0,
                        0,
                    ),
                };
                context.fail_request(&request, RequestError::from_io(&error, &path, offset, size));
            }
        }
    }

    /// Settles every cancelled or expired request the drive holds. Queued
    /// ones are dropped; in-flight ones are aborted and their channel freed.
    fn drop_abandoned(&mut self, context: &StreamerContext) -> bool {
        let queued = self.pending_len();
        self.pending_reads
            .retain(|request| !context.reject_if_abandoned(request));
        self.pending_requests
            .retain(|request| !context.reject_if_abandoned(request));
        let mut dropped = queued - self.pending_len();

        let mut abandoned = Vec::new();
        for (id, operation) in &self.active {
            if context.reject_if_abandoned(&operation.request) {
                abandoned.push(*id);
            }
        }
        for id in abandoned {
            if let Some(operation) = self.active.remove(&id) {
                operation.task.abort();
                self.counters.aborted += 1;
                dropped += 1;
                debug!(
                    "Drive '{}' aborted request {} ({})",
                    self.link.name(),
                    id,
                    operation.request.status()
                );
            }
        }
        dropped > 0
    }

    fn estimate_from<'a>(
        &self,
        mut at: Timestamp,
        request: &'a FileRequest,
        head: &mut Option<(&'a Path, u64)>,
    ) -> Timestamp {
        match request.command() {
            RequestCommand::Read { path, offset, size } => {
                at += self.positioning_cost(*head, path, *offset);
                at += self.read_cost(*size);
                *head = Some((path.as_path(), offset.saturating_add(*size)));
            }
            RequestCommand::FileExists { .. } | RequestCommand::FileMetaData { .. } => {
                at += self.request_cost();
            }
            RequestCommand::Flush { .. } | RequestCommand::FlushAll => return at,
        }
        request.set_estimated_completion(at);
        at
    }
}

impl StreamStage for StorageDrive {
    fn link(&self) -> &StageLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StageLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        let Some(context) = self.link.context().cloned() else {
            self.link.forward_prepare(request);
            return;
        };
        if matches!(
            request.command(),
            RequestCommand::Flush { .. } | RequestCommand::FlushAll
        ) {
            self.handle_flush(request);
            return;
        }
        if !request
            .command()
            .path()
            .is_some_and(|path| self.config.services(path))
        {
            trace!(
                "Drive '{}' passing on request {}, path not served here",
                self.link.name(),
                request.id()
            );
            self.counters.forwarded += 1;
            self.link.forward_prepare(request);
            return;
        }
        if let Some(reply) = self.cached_reply(request.command()) {
            self.counters.meta_data_cache_hits += 1;
            context.complete_request(&request, reply);
            return;
        }
        context.push_prepared_request(request);
    }

    fn queue_request(&mut self, request: Arc<FileRequest>) {
        match request.command() {
            RequestCommand::Read { .. } => {
                request.advance(RequestStatus::Queued);
                enqueue_by_priority(&mut self.pending_reads, request)
            }
            RequestCommand::FileExists { .. } | RequestCommand::FileMetaData { .. } => {
                request.advance(RequestStatus::Queued);
                enqueue_by_priority(&mut self.pending_requests, request)
            }
            RequestCommand::Flush { .. } | RequestCommand::FlushAll => self.handle_flush(request),
        }
    }

    fn execute_requests(&mut self) -> bool {
        let mut progressed = false;

        while let Ok(completion) = self.completions_rx.try_recv() {
            self.finish(completion);
            progressed = true;
        }

        if let Some(context) = self.link.context().cloned() {
            progressed |= self.drop_abandoned(&context);
        }

        while self.active.len() < self.config.io_channels as usize {
            let Some(request) = self.pop_next() else {
                break;
            };
            progressed = true;
            if let Some(context) = self.link.context()
                && context.reject_if_abandoned(&request)
            {
                continue;
            }
            self.start(request);
        }

        self.link.forward_execute() || progressed
    }

    fn update_status(&self, status: &mut Status) {
        status.fold(
            self.available_slots(),
            self.active.is_empty() && self.pending_reads.is_empty() && self.pending_requests.is_empty(),
        );
        self.link.forward_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Timestamp,
        internal_pending: &mut Vec<Arc<FileRequest>>,
        pending: &[Arc<FileRequest>],
    ) {
        self.link.forward_estimates(now, internal_pending, pending);

        let mut earliest: Option<Timestamp> = None;
        for active in self.active.values() {
            let cost = match active.read_size {
                Some(size) => active.positioning + self.read_cost(size),
                None => self.request_cost(),
            };
            let finish = (active.started + cost).max(now);
            active.request.set_estimated_completion(finish);
            earliest = Some(earliest.map_or(finish, |current| current.min(finish)));
        }

        let mut at = if self.active.len() < self.config.io_channels as usize {
            now
        } else {
            earliest.unwrap_or(now)
        };

        let mut head = self
            .last_read
            .as_ref()
            .map(|(file, end)| (file.as_path(), *end));
        for request in self.pending_requests.iter().chain(self.pending_reads.iter()) {
            at = self.estimate_from(at, request, &mut head);
        }
        for request in internal_pending.iter().rev() {
            at = self.estimate_from(at, request, &mut head);
        }
        for request in pending {
            at = self.estimate_from(at, request, &mut head);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let name = self.link.name();
        statistics.push(Statistic::integer(name, "Reads", self.counters.reads as i64));
        statistics.push(Statistic::byte_size(name, "Bytes read", self.counters.bytes_read));
        statistics.push(Statistic::bytes_per_second(name, "Read speed", self.bytes_per_second()));
        statistics.push(Statistic::byte_size(name, "Average read size", self.read_sizes.average()));
        statistics.push(Statistic::time(
            name,
            "Average open time",
            Duration::from_micros(self.open_times_us.average()),
        ));
        statistics.push(Statistic::percentage(name, "File switches", self.ratio(self.counters.file_switches)));
        statistics.push(Statistic::percentage(name, "Seeks", self.ratio(self.counters.seeks)));
        statistics.push(Statistic::integer(name, "File exists checks", self.counters.exists_checks as i64));
        statistics.push(Statistic::integer(name, "Metadata queries", self.counters.meta_data_queries as i64));
        statistics.push(Statistic::integer(name, "Metadata cache hits", self.counters.meta_data_cache_hits as i64));
        statistics.push(Statistic::integer(name, "Cached file handles", self.file_handles.len() as i64));
        statistics.push(Statistic::integer(name, "Cached metadata", self.meta_data.len() as i64));
        statistics.push(Statistic::integer(name, "Flushes", self.counters.flushes as i64));
        statistics.push(Statistic::integer(name, "Forwarded", self.counters.forwarded as i64));
        statistics.push(Statistic::integer(name, "Retries", self.counters.retries as i64));
        statistics.push(Statistic::integer(name, "Failures", self.counters.failures as i64));
        statistics.push(Statistic::integer(name, "Aborted", self.counters.aborted as i64));
        statistics.push(Statistic::integer(name, "Active", self.active.len() as i64));
        statistics.push(Statistic::integer(name, "Pending", self.pending_len() as i64));
        statistics.push(Statistic::integer(name, "Available slots", self.available_slots() as i64));
        self.link.forward_statistics(statistics);
    }
}

impl fmt::Debug for StorageDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDrive")
            .field("config", &self.config)
            .field("pending_reads", &self.pending_reads.len())
            .field("pending_requests", &self.pending_requests.len())
            .field("active", &self.active.len())
            .field("file_handles", &self.file_handles.len())
            .field("meta_data", &self.meta_data.len())
            .finish()
    }
}

impl Drop for StorageDrive {
    fn drop(&mut self) {
        if !self.active.is_empty() {
            debug!(
                "Drive '{}' dropped with {} operations in flight, aborting them",
                self.link.name(),
                self.active.len()
            );
            for operation in self.active.values() {
                operation.task.abort();
            }
        }
    }
}
