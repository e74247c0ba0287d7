//! Stage doubles shared by the integration tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use streamstack::common::config::RequestId;
use streamstack::streamer::request::{FileRequest, enqueue_by_priority};
use streamstack::streamer::request_status::RequestReply;
use streamstack::streamer::stage::{StageLink, Status, StreamStage};

/// `(stage, request)` in the order stages saw `prepare_request`
pub type Trace = Arc<Mutex<Vec<(String, RequestId)>>>;

pub fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn stage_names(trace: &Trace) -> Vec<String> {
    trace.lock().iter().map(|(stage, _)| stage.clone()).collect()
}

/// Records every request it sees, then hands it on unchanged
pub struct DecliningStage {
    link: StageLink,
    trace: Trace,
}

impl DecliningStage {
    pub fn new(name: &str, trace: &Trace) -> Self {
        Self {
            link: StageLink::new(name),
            trace: Arc::clone(trace),
        }
    }
}

impl StreamStage for DecliningStage {
    fn link(&self) -> &StageLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StageLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        self.trace
            .lock()
            .push((self.link.name().to_string(), request.id()));
        self.link.forward_prepare(request);
    }
}

/// What a [`ResolvingStage`] has done, readable after the stage moved into
/// a stack.
#[derive(Debug, Default)]
pub struct Resolved {
    pub completed: Vec<RequestId>,
    pub max_queued: usize,
}

/// Terminal stage with a fixed number of slots. Completes the best queued
/// request on every execute call.
pub struct ResolvingStage {
    link: StageLink,
    trace: Trace,
    capacity: i32,
    queue: VecDeque<Arc<FileRequest>>,
    resolved: Arc<Mutex<Resolved>>,
}

impl ResolvingStage {
    pub fn new(name: &str, capacity: i32, trace: &Trace) -> (Self, Arc<Mutex<Resolved>>) {
        let resolved = Arc::new(Mutex::new(Resolved::default()));
        let stage = Self {
            link: StageLink::new(name),
            trace: Arc::clone(trace),
            capacity,
            queue: VecDeque::new(),
            resolved: Arc::clone(&resolved),
        };
        (stage, resolved)
    }
}

impl StreamStage for ResolvingStage {
    fn link(&self) -> &StageLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StageLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        self.trace
            .lock()
            .push((self.link.name().to_string(), request.id()));
        if let Some(context) = self.link.context() {
            context.push_prepared_request(request);
        }
    }

    fn queue_request(&mut self, request: Arc<FileRequest>) {
        enqueue_by_priority(&mut self.queue, request);
        let mut resolved = self.resolved.lock();
        resolved.max_queued = resolved.max_queued.max(self.queue.len());
    }

    fn execute_requests(&mut self) -> bool {
        let Some(context) = self.link.context().cloned() else {
            return false;
        };
        let Some(request) = self.queue.pop_front() else {
            return false;
        };
        if !context.reject_if_abandoned(&request) {
            self.resolved.lock().completed.push(request.id());
            context.complete_request(&request, RequestReply::Done);
        }
        true
    }

    fn update_status(&self, status: &mut Status) {
        status.fold(
            self.capacity - self.queue.len() as i32,
            self.queue.is_empty(),
        );
    }
}
