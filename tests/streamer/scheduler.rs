use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use streamstack::common::time::ManualClock;
use streamstack::streamer::config::StreamerConfig;
use streamstack::streamer::context::StreamerContext;
use streamstack::streamer::request::{RequestBuilder, RequestPriority};
use streamstack::streamer::request_status::{RequestReply, RequestStatus};
use streamstack::streamer::scheduler::Scheduler;
use streamstack::streamer::stack::StreamStack;
use streamstack::streamer::stage::stage_ref;

use crate::assert_ok;
use crate::common::logger::init_test_logger;
use crate::common::stages::{Resolved, ResolvingStage, trace};

struct TestContext {
    scheduler: Scheduler,
    resolved: Arc<Mutex<Resolved>>,
}

impl TestContext {
    fn new(capacity: i32, config: StreamerConfig) -> Self {
        Self::with_context(capacity, config, Arc::new(StreamerContext::default()))
    }

    fn with_context(capacity: i32, config: StreamerConfig, context: Arc<StreamerContext>) -> Self {
        init_test_logger();
        let (stage, resolved) = ResolvingStage::new("resolver", capacity, &trace());
        let stack = assert_ok!(StreamStack::new("scheduler-test", vec![stage_ref(stage)]));
        let scheduler = assert_ok!(Scheduler::new(stack, context, config));
        Self { scheduler, resolved }
    }

    fn context(&self) -> &Arc<StreamerContext> {
        self.scheduler.context()
    }
}

fn single_pass() -> StreamerConfig {
    StreamerConfig {
        max_execute_passes: 1,
        ..StreamerConfig::default()
    }
}

#[test]
fn fresh_scheduler_reports_idle() {
    let ctx = TestContext::new(4, StreamerConfig::default());
    let status = ctx.scheduler.status();
    assert!(status.is_idle);
    assert_eq!(status.available_slots, 4);
}

#[test]
fn admission_never_exceeds_slots() {
    let mut ctx = TestContext::new(3, single_pass());
    let handles: Vec<_> = (0..10)
        .map(|_| ctx.context().submit(RequestBuilder::file_exists("x")))
        .collect();

    let report = ctx.scheduler.tick();
    assert_eq!(report.submitted, 10);
    assert_eq!(report.admitted, 3);
    assert_eq!(ctx.context().prepared_len(), 7);
    assert!(!report.status.is_idle);

    assert!(ctx.scheduler.run_until_idle(50));
    assert!(ctx.resolved.lock().max_queued <= 3);
    assert!(handles.iter().all(|h| h.status() == RequestStatus::Completed));
    assert_eq!(ctx.context().counters().outstanding(), 0);
}

#[test]
fn slots_are_capped_by_max_concurrent_requests() {
    let ctx = TestContext::new(
        100,
        StreamerConfig {
            max_concurrent_requests: 2,
            ..StreamerConfig::default()
        },
    );
    assert_eq!(ctx.scheduler.status().available_slots, 2);
}

#[test]
fn higher_priority_served_first_then_arrival_order() {
    let mut ctx = TestContext::new(1, single_pass());
    let low_first = ctx
        .context()
        .submit(RequestBuilder::file_exists("a").priority(RequestPriority::Low));
    let high = ctx
        .context()
        .submit(RequestBuilder::file_exists("b").priority(RequestPriority::High));
    let low_second = ctx
        .context()
        .submit(RequestBuilder::file_exists("c").priority(RequestPriority::Low));

    assert!(ctx.scheduler.run_until_idle(20));
    assert_eq!(
        ctx.resolved.lock().completed,
        vec![high.id(), low_first.id(), low_second.id()]
    );
}

#[test]
fn callback_fires_exactly_once() {
    let mut ctx = TestContext::new(2, StreamerConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = ctx.context().submit(
        RequestBuilder::file_exists("x").on_complete(move |request| {
            assert!(request.status().is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(ctx.scheduler.run_until_idle(10));
    for _ in 0..3 {
        ctx.scheduler.tick();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A second settle is a no-op.
    assert!(!ctx.context().settle_request(
        handle.request(),
        RequestStatus::Failed(streamstack::common::exception::RequestError::Io("late".into())),
        None
    ));
    assert_eq!(handle.status(), RequestStatus::Completed);
    assert_eq!(handle.reply(), Some(RequestReply::Done));
}

#[test]
fn cancel_before_tick_settles_as_cancelled() {
    let mut ctx = TestContext::new(2, StreamerConfig::default());
    let seen = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&seen);
    let handle = ctx.context().submit(
        RequestBuilder::file_exists("x")
            .on_complete(move |request| *observed.lock() = Some(request.status())),
    );
    assert!(handle.cancel());

    ctx.scheduler.tick();
    assert_eq!(handle.status(), RequestStatus::Cancelled);
    assert_eq!(*seen.lock(), Some(RequestStatus::Cancelled));
    assert!(ctx.resolved.lock().completed.is_empty());
    assert_eq!(ctx.context().counters().cancelled(), 1);
    assert!(!handle.cancel());
}

#[test]
fn expired_deadline_times_out() {
    let clock = Arc::new(ManualClock::new());
    let context = Arc::new(StreamerContext::new(clock.clone()));
    let mut ctx = TestContext::with_context(1, StreamerConfig::default(), Arc::clone(&context));

    let deadline = context.now() + Duration::from_millis(10);
    let late = context.submit(RequestBuilder::file_exists("late").deadline(deadline));
    let on_time = context.submit(RequestBuilder::file_exists("fine"));
    clock.advance(Duration::from_millis(20));

    assert!(ctx.scheduler.run_until_idle(10));
    assert_eq!(late.status(), RequestStatus::TimedOut);
    assert_eq!(on_time.status(), RequestStatus::Completed);
    assert_eq!(context.counters().timed_out(), 1);
}

#[test]
fn estimates_cleared_once_done() {
    let mut ctx = TestContext::new(1, single_pass());
    let handle = ctx.context().submit(RequestBuilder::file_exists("x"));
    assert!(ctx.scheduler.run_until_idle(10));
    assert!(handle.is_done());
    assert_eq!(handle.estimated_completion(), None);
}
