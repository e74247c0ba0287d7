//! # Streamer Service
//!
//! Runs a [`Scheduler`] on a dedicated thread and exposes the caller-facing
//! surface: submit, cancel, poll status and estimates, collect statistics.
//!
//! ```text
//!   caller threads                          "streamer-<stack>" thread
//!   ════════════════════════════════════════════════════════════════════════
//!   submit ──► context.submit ──┐
//!   cancel ──► handle.cancel  ──┼──► wake (bounded(1), try_send)
//!                               │          │
//!                               │          ▼
//!                               │    loop { tick; wait poll_interval
//!                               │           (busy) or idle_wait (idle) }
//!                               │          │
//!   poll_status ◄── RwLock<Status> ◄───────┘ publish
//!   poll_estimate ◄── request estimate
//! ```
//!
//! Dropping the streamer stops the loop once the stack is idle and joins the
//! thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use super::config::StreamerConfig;
use super::context::StreamerContext;
use super::request::{RequestBuilder, RequestHandle};
use super::scheduler::Scheduler;
use super::stack::StreamStack;
use super::stage::{Status, StreamStage};
use super::statistics::Statistic;
use crate::common::exception::StreamerError;
use crate::common::time::Timestamp;

pub struct Streamer {
    scheduler: Arc<Mutex<Scheduler>>,
    context: Arc<StreamerContext>,
    published: Arc<RwLock<Status>>,
    wake: Sender<()>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Streamer {
    pub fn start(stack: StreamStack, config: StreamerConfig) -> Result<Self, StreamerError> {
        Self::start_with_context(stack, Arc::new(StreamerContext::default()), config)
    }

    pub fn start_with_context(
        stack: StreamStack,
        context: Arc<StreamerContext>,
        config: StreamerConfig,
    ) -> Result<Self, StreamerError> {
        let thread_name = format!("streamer-{}", stack.name());
        let poll_interval = config.poll_interval();
        let idle_wait = config.idle_wait();
        let scheduler = Scheduler::new(stack, Arc::clone(&context), config)?;
        let published = scheduler.published_status();
        let scheduler = Arc::new(Mutex::new(scheduler));

        let (wake, wake_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let scheduler = Arc::clone(&scheduler);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run(scheduler, wake_rx, stop, poll_interval, idle_wait))
                .map_err(StreamerError::Spawn)?
        };

        info!("Started {}", thread_name);
        Ok(Self {
            scheduler,
            context,
            published,
            wake,
            stop,
            worker: Some(worker),
        })
    }

    pub fn context(&self) -> &Arc<StreamerContext> {
        &self.context
    }

    fn notify(&self) {
        // A full channel already holds a pending wake-up.
        let _ = self.wake.try_send(());
    }

    /// Queues a request for the next tick. Never waits on the scheduler.
    pub fn submit(&self, request: RequestBuilder) -> RequestHandle {
        let handle = self.context.submit(request);
        self.notify();
        handle
    }

    /// Cooperative: the request settles as `Cancelled` at its next checkpoint.
    /// Returns false if it had already settled.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let cancelled = handle.cancel();
        if cancelled {
            self.notify();
        }
        cancelled
    }

    pub fn poll_status(&self) -> Status {
        *self.published.read()
    }

    pub fn poll_estimate(&self, handle: &RequestHandle) -> Option<Timestamp> {
        handle.estimated_completion()
    }

    /// Waits for the tick to finish before collecting
    pub fn collect_statistics(&self) -> Vec<Statistic> {
        self.scheduler.lock().collect_statistics()
    }

    /// Runs `f` against the stack between ticks, e.g. to rebind stages
    pub fn with_stack<R>(&self, f: impl FnOnce(&mut StreamStack) -> R) -> R {
        let mut scheduler = self.scheduler.lock();
        f(scheduler.stack_mut())
    }

    /// Blocks until every submitted request has been finalised and the stack
    /// reports idle. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_status().is_idle && self.context.counters().outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.notify();
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the scheduler thread once the stack drains
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.notify();
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.join()
        {
            info!("Failed to join scheduler thread: {:?}", e);
        }
    }
}

fn run(
    scheduler: Arc<Mutex<Scheduler>>,
    wake: Receiver<()>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    idle_wait: Duration,
) {
    loop {
        let report = scheduler.lock().tick();
        let idle = report.status.is_idle;

        if stop.load(Ordering::Acquire) && idle {
            debug!("Scheduler thread stopping");
            break;
        }
        if report.progressed && !idle {
            continue;
        }

        let wait = if idle { idle_wait } else { poll_interval };
        match wake.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => stop.store(true, Ordering::Release),
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("status", &self.poll_status())
            .field("running", &self.worker.is_some())
            .finish()
    }
}
