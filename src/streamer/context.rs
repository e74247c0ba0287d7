//! # Streamer Context
//!
//! Shared, thread-safe state for one stream stack: the submission queue fed by
//! caller threads, the prepared queue drained by the scheduler, the list of
//! requests waiting for finalisation, the id counter and the clock.
//!
//! ## Data Flow
//!
//! ```text
//!   caller threads                         scheduler thread
//!   ═══════════════════════════════════════════════════════════════════════════
//!
//!   submit(builder) ──► submissions ──► take_submissions() ──► prepare_request
//!                       (short lock)                                 │
//!                                                                    ▼
//!                                  prepared  ◄── push_prepared_request (stages)
//!                       (priority map, arrival snapshots)            │
//!                                                                    ▼
//!                                               pop_prepared_request ──► queue
//!
//!   stages: complete_request / fail_request ──► completed ──► finalize
//!                                                 (hooks, callbacks, parents)
//! ```
//!
//! Every lock here is held only for a push, a pop or a `mem::take`; hooks and
//! callbacks always run with no context lock held.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use super::request::{
    CompletionHook, FileRequest, RequestBuilder, RequestCommand, RequestHandle, RequestPriority,
    SharedBuffer,
};
use super::request_status::{RequestReply, RequestStatus};
use super::statistics::{RequestCounters, Statistic};
use crate::common::config::RequestId;
use crate::common::exception::RequestError;
use crate::common::time::{Clock, MonotonicClock, Timestamp};

const CONTEXT_NAME: &str = "Context";

/// Requests that finished preparation but have not been given an execution
/// slot. Iterates by priority (then arrival) for admission, and can hand out
/// arrival-ordered snapshots for estimation.
#[derive(Debug, Default)]
pub struct PreparedQueue {
    entries: BTreeMap<(Reverse<RequestPriority>, RequestId), Arc<FileRequest>>,
}

impl PreparedQueue {
    pub fn push(&mut self, request: Arc<FileRequest>) {
        self.entries
            .insert((Reverse(request.priority()), request.id()), request);
    }

    /// Removes the highest priority, oldest request
    pub fn pop(&mut self) -> Option<Arc<FileRequest>> {
        self.entries.pop_first().map(|(_, request)| request)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest arrival first
    pub fn by_arrival(&self) -> Vec<Arc<FileRequest>> {
        let mut requests: Vec<_> = self.entries.values().cloned().collect();
        requests.sort_by_key(|request| request.id());
        requests
    }
}

pub struct StreamerContext {
    clock: Arc<dyn Clock>,
    next_request_id: AtomicU64,
    submissions: Mutex<Vec<Arc<FileRequest>>>,
    prepared: Mutex<PreparedQueue>,
    completed: Mutex<Vec<Arc<FileRequest>>>,
    counters: RequestCounters,
}

impl StreamerContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_request_id: AtomicU64::new(1),
            submissions: Mutex::new(Vec::new()),
            prepared: Mutex::new(PreparedQueue::default()),
            completed: Mutex::new(Vec::new()),
            counters: RequestCounters::default(),
        }
    }

    pub fn with_monotonic_clock() -> Self {
        Self::new(Arc::new(MonotonicClock))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn counters(&self) -> &RequestCounters {
        &self.counters
    }

    fn next_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a new external request for the next tick. Safe from any thread;
    /// never waits on the tick beyond the push itself.
    pub fn submit(&self, builder: RequestBuilder) -> RequestHandle {
        let request = Arc::new(builder.build(self.next_id()));
        trace!(
            "Submitting request {} ({})",
            request.id(),
            request.command().name()
        );
        self.submissions.lock().push(Arc::clone(&request));
        self.counters.record_submitted();
        RequestHandle::new(request)
    }

    pub fn take_submissions(&self) -> Vec<Arc<FileRequest>> {
        std::mem::take(&mut *self.submissions.lock())
    }

    pub fn has_submissions(&self) -> bool {
        !self.submissions.lock().is_empty()
    }

    /// Creates a sub-request of `parent`. The parent will not settle until this
    /// child (and any siblings) have settled.
    pub fn create_internal_request(
        &self,
        parent: &Arc<FileRequest>,
        command: RequestCommand,
        output: Option<SharedBuffer>,
        hook: Option<CompletionHook>,
    ) -> Arc<FileRequest> {
        let child = Arc::new(FileRequest::new_internal(
            self.next_id(),
            parent,
            command,
            output,
            hook,
        ));
        parent.attach_child();
        parent.advance(RequestStatus::Prepared);
        child
    }

    pub fn push_prepared_request(&self, request: Arc<FileRequest>) {
        request.advance(RequestStatus::Prepared);
        self.prepared.lock().push(request);
    }

    pub fn pop_prepared_request(&self) -> Option<Arc<FileRequest>> {
        self.prepared.lock().pop()
    }

    pub fn prepared_len(&self) -> usize {
        self.prepared.lock().len()
    }

    /// Snapshot of the prepared queue, oldest arrival first. Callers iterate
    /// the snapshot, so new pushes never invalidate an ongoing pass.
    pub fn prepared_snapshot(&self) -> Vec<Arc<FileRequest>> {
        self.prepared.lock().by_arrival()
    }

    pub fn complete_request(&self, request: &Arc<FileRequest>, reply: RequestReply) {
        self.settle_request(request, RequestStatus::Completed, Some(reply));
    }

    pub fn fail_request(&self, request: &Arc<FileRequest>, error: RequestError) {
        debug!("Request {} failed: {}", request.id(), error);
        self.settle_request(request, RequestStatus::Failed(error), None);
    }

    pub fn cancel_request(&self, request: &Arc<FileRequest>) {
        self.settle_request(request, RequestStatus::Cancelled, None);
    }

    /// Moves a request into a terminal state and schedules it for
    /// finalisation. Only the first call for a request has any effect.
    pub fn settle_request(
        &self,
        request: &Arc<FileRequest>,
        status: RequestStatus,
        reply: Option<RequestReply>,
    ) -> bool {
        if !request.settle(status, reply) {
            return false;
        }
        self.completed.lock().push(Arc::clone(request));
        true
    }

    pub fn has_completed(&self) -> bool {
        !self.completed.lock().is_empty()
    }

    /// Cooperative checkpoint. Settles the request as `Cancelled` if it (or an
    /// ancestor) was cancelled, or `TimedOut` if its deadline has passed.
    /// Returns true if the caller must stop processing the request.
    pub fn reject_if_abandoned(&self, request: &Arc<FileRequest>) -> bool {
        if request.is_done() {
            return true;
        }
        if request.is_cancel_requested() {
            trace!("Request {} cancelled at checkpoint", request.id());
            self.settle_request(request, RequestStatus::Cancelled, None);
            return true;
        }
        if request.is_past_deadline(self.now()) {
            debug!("Request {} missed its deadline", request.id());
            self.settle_request(request, RequestStatus::TimedOut, None);
            return true;
        }
        false
    }

    /// Runs stage hooks and caller callbacks for every settled request, then
    /// folds each into its parent. Parents that settle as a result are
    /// finalised in the same call. Returns true if anything was finalised.
    pub fn finalize_completed_requests(&self) -> bool {
        let mut finalized_any = false;
        loop {
            let batch = std::mem::take(&mut *self.completed.lock());
            if batch.is_empty() {
                break;
            }
            finalized_any = true;
            for request in batch {
                self.finalize_request(&request);
            }
        }
        finalized_any
    }

    fn finalize_request(&self, request: &Arc<FileRequest>) {
        let status = request.status();
        trace!("Finalizing request {} as {}", request.id(), status);

        let (hook, callback) = request.take_completion();
        if let Some(hook) = hook {
            hook(request.as_ref());
        }
        if let Some(callback) = callback {
            callback(request.as_ref());
        }

        if !request.is_internal() {
            match status {
                RequestStatus::Completed => self.counters.record_completed(),
                RequestStatus::Failed(_) => self.counters.record_failed(),
                RequestStatus::Cancelled => self.counters.record_cancelled(),
                RequestStatus::TimedOut => self.counters.record_timed_out(),
                _ => {}
            }
        }

        if let Some(parent) = request.parent()
            && let Some((parent_status, reply)) = parent.child_settled(request)
        {
            self.settle_request(parent, parent_status, reply);
        }
    }

    pub fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        self.counters.collect(CONTEXT_NAME, statistics);
        statistics.push(Statistic::integer(
            CONTEXT_NAME,
            "Prepared",
            self.prepared_len() as i64,
        ));
    }
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::with_monotonic_clock()
    }
}

impl fmt::Debug for StreamerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamerContext")
            .field("clock", &self.clock)
            .field("next_request_id", &self.next_request_id)
            .field("prepared", &self.prepared_len())
            .finish()
    }
}
