use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use streamstack::streamer::config::{StorageDriveConfig, StreamerConfig};
use streamstack::streamer::request::{RequestBuilder, RequestPriority, shared_buffer};
use streamstack::streamer::request_status::{RequestReply, RequestStatus};
use streamstack::streamer::service::Streamer;
use streamstack::streamer::stack::StreamStack;
use streamstack::streamer::stage::stage_ref;
use streamstack::streamer::stages::StorageDrive;
use streamstack::streamer::statistics::find;

use crate::assert_ok;
use crate::common::logger::init_test_logger;
use crate::common::stages::{ResolvingStage, trace};

const WAIT: Duration = Duration::from_secs(10);

fn resolving_streamer(capacity: i32) -> Streamer {
    init_test_logger();
    let (stage, _) = ResolvingStage::new("resolver", capacity, &trace());
    let stack = assert_ok!(StreamStack::new("service", vec![stage_ref(stage)]));
    assert_ok!(Streamer::start(stack, StreamerConfig::default()))
}

#[test]
fn submissions_complete_in_the_background() {
    let streamer = resolving_streamer(2);
    let calls = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let calls = Arc::clone(&calls);
            let priority = if i % 3 == 0 {
                RequestPriority::High
            } else {
                RequestPriority::Normal
            };
            streamer.submit(
                RequestBuilder::file_exists(format!("f{}", i))
                    .priority(priority)
                    .on_complete(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }),
            )
        })
        .collect();

    assert!(streamer.wait_until_idle(WAIT));
    assert!(handles.iter().all(|h| h.status() == RequestStatus::Completed));
    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert!(streamer.poll_status().is_idle);
}

#[test]
fn submitting_from_many_threads() {
    let streamer = Arc::new(resolving_streamer(4));
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let streamer = Arc::clone(&streamer);
            thread::spawn(move || {
                (0..25)
                    .map(|i| streamer.submit(RequestBuilder::file_exists(format!("{}-{}", t, i))))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let handles: Vec<_> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();

    assert!(streamer.wait_until_idle(WAIT));
    assert_eq!(handles.len(), 100);
    assert!(handles.iter().all(|h| h.is_done()));
    assert_eq!(streamer.context().counters().completed(), 100);
}

#[test]
fn reads_local_files_and_reports_statistics() {
    init_test_logger();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::write(&path, b"streaming data").unwrap();

    let drive = StorageDrive::new(StorageDriveConfig::default(), runtime.handle().clone());
    let stack = assert_ok!(StreamStack::new("disk", vec![stage_ref(drive)]));
    let streamer = assert_ok!(Streamer::start(stack, StreamerConfig::default()));

    let output = shared_buffer();
    let handle = streamer.submit(RequestBuilder::read(&path, 10, 4, Arc::clone(&output)));
    assert!(streamer.wait_until_idle(WAIT));

    assert_eq!(handle.reply(), Some(RequestReply::BytesRead(4)));
    assert_eq!(*output.lock(), b"data".to_vec());
    assert_eq!(streamer.poll_estimate(&handle), None);

    let stats = streamer.collect_statistics();
    assert!(find(&stats, "Scheduler", "Ticks").is_some());
    assert!(find(&stats, "Storage drive", "Bytes read").is_some());
    streamer.shutdown();
}

#[test]
fn cancels_racing_completions_fire_each_callback_once() {
    let streamer = Arc::new(resolving_streamer(2));
    let count = 200;
    let calls: Arc<Vec<AtomicUsize>> = Arc::new((0..count).map(|_| AtomicUsize::new(0)).collect());

    let handles: Arc<Vec<_>> = Arc::new(
        (0..count)
            .map(|i| {
                let calls = Arc::clone(&calls);
                streamer.submit(RequestBuilder::file_exists(format!("r{}", i)).on_complete(
                    move |_| {
                        calls[i].fetch_add(1, Ordering::SeqCst);
                    },
                ))
            })
            .collect(),
    );

    // Two threads cancel the even requests while the scheduler resolves them
    let cancellers: Vec<_> = (0..2)
        .map(|_| {
            let streamer = Arc::clone(&streamer);
            let handles = Arc::clone(&handles);
            thread::spawn(move || {
                for handle in handles.iter().step_by(2) {
                    streamer.cancel(handle);
                }
            })
        })
        .collect();
    for canceller in cancellers {
        canceller.join().unwrap();
    }
    assert!(streamer.wait_until_idle(WAIT));

    for (handle, calls) in handles.iter().zip(calls.iter()) {
        assert_eq!(calls.load(Ordering::SeqCst), 1, "request {}", handle.id());
        assert!(matches!(
            handle.status(),
            RequestStatus::Completed | RequestStatus::Cancelled
        ));
    }
    assert!(
        handles
            .iter()
            .skip(1)
            .step_by(2)
            .all(|h| h.status() == RequestStatus::Completed)
    );
    let counters = streamer.context().counters();
    assert_eq!(counters.completed() + counters.cancelled(), count as u64);
    assert!(counters.cancelled() <= (count / 2) as u64);
    assert_eq!(counters.outstanding(), 0);
}

#[test]
fn cancel_after_completion_is_rejected() {
    let streamer = resolving_streamer(1);
    let handle = streamer.submit(RequestBuilder::file_exists("x"));
    assert!(streamer.wait_until_idle(WAIT));
    assert!(!streamer.cancel(&handle));
    assert_eq!(handle.status(), RequestStatus::Completed);
}

#[test]
fn drop_joins_the_scheduler_thread() {
    let streamer = resolving_streamer(1);
    let handle = streamer.submit(RequestBuilder::file_exists("x"));
    drop(streamer);
    assert_eq!(handle.status(), RequestStatus::Completed);
}

#[test]
fn stack_can_be_inspected_between_ticks() {
    let streamer = resolving_streamer(1);
    let names = streamer.with_stack(|stack| stack.stage_names());
    assert_eq!(names, vec!["resolver"]);
}
