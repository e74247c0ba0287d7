use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tokio::runtime::Runtime;

use streamstack::streamer::config::{
    ReadCacheConfig, ReadSplitterConfig, StorageDriveConfig, StreamerConfig,
};
use streamstack::streamer::context::StreamerContext;
use streamstack::streamer::request::{RequestBuilder, shared_buffer};
use streamstack::streamer::request_status::{RequestReply, RequestStatus};
use streamstack::streamer::scheduler::Scheduler;
use streamstack::streamer::stack::StreamStack;
use streamstack::streamer::stage::stage_ref;
use streamstack::streamer::stages::{
    DriveBackend, DriveFuture, ReadCache, ReadSplitter, StorageDrive,
};
use streamstack::streamer::statistics::{StatisticValue, find};

use crate::assert_ok;
use crate::common::logger::init_test_logger;

struct TestContext {
    runtime: Runtime,
    dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        init_test_logger();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        Self {
            runtime,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_file(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = self.dir.path().join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    /// Splitter (256 byte reads) -> cache -> local drive
    fn scheduler(&self, drive: StorageDriveConfig) -> Scheduler {
        let splitter = ReadSplitter::new(&ReadSplitterConfig {
            max_read_size: 256,
            ..ReadSplitterConfig::default()
        });
        let cache = ReadCache::new(&ReadCacheConfig::default());
        let drive = StorageDrive::new(drive, self.runtime.handle().clone());
        let stack = assert_ok!(StreamStack::new(
            "local",
            vec![stage_ref(splitter), stage_ref(cache), stage_ref(drive)],
        ));
        assert_ok!(Scheduler::new(
            stack,
            Arc::new(StreamerContext::default()),
            StreamerConfig::default()
        ))
    }

    /// Splitter (256 byte reads) -> two channel drive over `backend`
    fn stalled_scheduler(&self, backend: Arc<StalledBackend>) -> Scheduler {
        let splitter = ReadSplitter::new(&ReadSplitterConfig {
            max_read_size: 256,
            ..ReadSplitterConfig::default()
        });
        let drive = StorageDrive::with_backend(
            StorageDriveConfig {
                io_channels: 2,
                ..StorageDriveConfig::default()
            },
            self.runtime.handle().clone(),
            backend,
        );
        let stack = assert_ok!(StreamStack::new(
            "stalled",
            vec![stage_ref(splitter), stage_ref(drive)],
        ));
        assert_ok!(Scheduler::new(
            stack,
            Arc::new(StreamerContext::default()),
            StreamerConfig::default()
        ))
    }
}

/// Drops a count when the read holding it goes away
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A device whose reads never finish
#[derive(Default)]
struct StalledBackend {
    dropped: Arc<AtomicUsize>,
}

impl DriveBackend for StalledBackend {
    fn read(&self, _path: PathBuf, _offset: u64, _size: u64) -> DriveFuture<Vec<u8>> {
        let guard = DropCounter(Arc::clone(&self.dropped));
        Box::pin(async move {
            let _guard = guard;
            std::future::pending::<io::Result<Vec<u8>>>().await
        })
    }

    fn exists(&self, _path: PathBuf) -> DriveFuture<bool> {
        Box::pin(async { Ok(true) })
    }

    fn file_size(&self, _path: PathBuf) -> DriveFuture<u64> {
        Box::pin(async { Ok(0) })
    }
}

fn drive_statistic(scheduler: &Scheduler, name: &str) -> Option<StatisticValue> {
    find(&scheduler.collect_statistics(), "Storage drive", name).map(|s| s.value.clone())
}

/// Ticks until every submitted request has settled and the stack is idle
fn drain(scheduler: &mut Scheduler) {
    for _ in 0..5000 {
        let report = scheduler.tick();
        if report.status.is_idle && scheduler.context().counters().outstanding() == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("scheduler did not drain: {:?}", scheduler);
}

#[test]
fn large_read_is_split_and_reassembled() {
    let ctx = TestContext::new();
    let (path, data) = ctx.write_file("level.pak", 1000);
    let mut scheduler = ctx.scheduler(StorageDriveConfig::default());

    let output = shared_buffer();
    let handle = scheduler
        .context()
        .submit(RequestBuilder::read(&path, 100, 800, Arc::clone(&output)));
    drain(&mut scheduler);

    assert_eq!(handle.status(), RequestStatus::Completed);
    assert_eq!(handle.reply(), Some(RequestReply::BytesRead(800)));
    assert_eq!(*output.lock(), data[100..900].to_vec());
}

#[test]
fn repeated_read_is_served_from_cache() {
    let ctx = TestContext::new();
    let (path, data) = ctx.write_file("texture.bin", 600);
    let mut scheduler = ctx.scheduler(StorageDriveConfig::default());

    let first = shared_buffer();
    scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, 600, Arc::clone(&first)));
    drain(&mut scheduler);

    let second = shared_buffer();
    let handle = scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, 600, Arc::clone(&second)));
    drain(&mut scheduler);

    assert_eq!(handle.status(), RequestStatus::Completed);
    assert_eq!(*second.lock(), data);

    let stats = scheduler.collect_statistics();
    let hits = find(&stats, "Read cache", "Hits").map(|s| s.value.clone());
    assert_eq!(hits, Some(StatisticValue::Integer(3)));
    let reads = find(&stats, "Storage drive", "Reads").map(|s| s.value.clone());
    assert_eq!(reads, Some(StatisticValue::Integer(3)));
}

#[test]
fn flush_forces_a_fresh_read() {
    let ctx = TestContext::new();
    let (path, _) = ctx.write_file("config.json", 64);
    let mut scheduler = ctx.scheduler(StorageDriveConfig::default());

    scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, 64, shared_buffer()));
    drain(&mut scheduler);

    std::fs::write(&path, vec![7u8; 64]).unwrap();
    let flush = scheduler.context().submit(RequestBuilder::flush(&path));
    drain(&mut scheduler);
    assert_eq!(flush.status(), RequestStatus::Completed);

    let output = shared_buffer();
    scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, 64, Arc::clone(&output)));
    drain(&mut scheduler);
    assert_eq!(*output.lock(), vec![7u8; 64]);
}

#[test]
fn metadata_requests_pass_through() {
    let ctx = TestContext::new();
    let (path, _) = ctx.write_file("sound.ogg", 4321);
    let mut scheduler = ctx.scheduler(StorageDriveConfig::default());

    let exists = scheduler
        .context()
        .submit(RequestBuilder::file_exists(&path));
    let missing = scheduler
        .context()
        .submit(RequestBuilder::file_exists(ctx.dir.path().join("nope")));
    let size = scheduler
        .context()
        .submit(RequestBuilder::file_meta_data(&path));
    drain(&mut scheduler);

    assert_eq!(exists.reply(), Some(RequestReply::Exists(true)));
    assert_eq!(missing.reply(), Some(RequestReply::Exists(false)));
    assert_eq!(size.reply(), Some(RequestReply::FileSize(4321)));
}

#[test]
fn failed_sub_read_fails_the_parent() {
    let ctx = TestContext::new();
    let (path, _) = ctx.write_file("short.bin", 300);
    let mut scheduler = ctx.scheduler(StorageDriveConfig::default());

    let handle = scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, 1024, shared_buffer()));
    drain(&mut scheduler);

    assert!(handle.status().is_failed());
    assert_eq!(scheduler.context().counters().failed(), 1);
}

#[test]
fn parent_estimates_never_move_earlier() {
    let ctx = TestContext::new();
    let (path, _) = ctx.write_file("world.pak", 4 * 1024);
    let mut scheduler = ctx.scheduler(StorageDriveConfig {
        io_channels: 1,
        ..StorageDriveConfig::default()
    });

    let handles: Vec<_> = (0..4)
        .map(|i| {
            scheduler.context().submit(RequestBuilder::read(
                &path,
                i * 1024,
                1024,
                shared_buffer(),
            ))
        })
        .collect();

    let mut last = vec![None; handles.len()];
    for _ in 0..5000 {
        let report = scheduler.tick();
        for (handle, last) in handles.iter().zip(last.iter_mut()) {
            if let Some(estimate) = handle.estimated_completion() {
                if let Some(previous) = *last {
                    assert!(estimate >= previous);
                }
                *last = Some(estimate);
            }
        }
        if report.status.is_idle && scheduler.context().counters().outstanding() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(handles.iter().all(|h| h.status() == RequestStatus::Completed));
    assert!(handles.iter().all(|h| h.estimated_completion().is_none()));
}

#[test]
fn cancelling_a_split_read_aborts_its_sub_reads() {
    let ctx = TestContext::new();
    let backend = Arc::new(StalledBackend::default());
    let mut scheduler = ctx.stalled_scheduler(Arc::clone(&backend));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let output = shared_buffer();
    let handle = scheduler.context().submit(
        RequestBuilder::read("stalled.pak", 0, 1024, Arc::clone(&output)).on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    for _ in 0..100 {
        scheduler.tick();
        if drive_statistic(&scheduler, "Active") == Some(StatisticValue::Integer(2)) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(drive_statistic(&scheduler, "Active"), Some(StatisticValue::Integer(2)));
    assert_eq!(handle.request().pending_children(), 4);

    assert!(handle.cancel());
    drain(&mut scheduler);

    assert_eq!(handle.status(), RequestStatus::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(output.lock().is_empty());
    assert_eq!(drive_statistic(&scheduler, "Active"), Some(StatisticValue::Integer(0)));
    assert_eq!(drive_statistic(&scheduler, "Aborted"), Some(StatisticValue::Integer(2)));
    assert_eq!(scheduler.context().counters().cancelled(), 1);

    for _ in 0..2000 {
        if backend.dropped.load(Ordering::SeqCst) == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(backend.dropped.load(Ordering::SeqCst), 2);
}

#[test]
fn oversized_read_fails_without_taking_down_the_stack() {
    let ctx = TestContext::new();
    let (path, data) = ctx.write_file("tiny.bin", 10);
    let mut scheduler = ctx.scheduler(StorageDriveConfig::default());

    let huge = scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, u64::MAX, shared_buffer()));
    drain(&mut scheduler);
    assert!(huge.status().is_failed());

    let output = shared_buffer();
    let after = scheduler
        .context()
        .submit(RequestBuilder::read(&path, 0, 10, Arc::clone(&output)));
    drain(&mut scheduler);
    assert_eq!(after.status(), RequestStatus::Completed);
    assert_eq!(*output.lock(), data);
}
