//! # Stream Stages
//!
//! A stage is one link in the processing chain. Every request flows through
//! the stages in order; each stage either services it (or derives
//! sub-requests from it) or hands it unmodified to the next stage.
//!
//! ## Contract
//!
//! | Operation                     | Direction  | Default behaviour              |
//! |-------------------------------|------------|--------------------------------|
//! | `prepare_request`             | top-down   | forward to next, else fail     |
//! | `queue_request`               | top-down   | forward to next, else fail     |
//! | `execute_requests`            | top-down   | delegate to next               |
//! | `update_status`               | top-down   | delegate to next               |
//! | `update_completion_estimates` | bottom-up  | delegate to next               |
//! | `collect_statistics`          | top-down   | delegate to next               |
//!
//! Estimation is computed bottom-up by nested delegation: a stage must call
//! into its successor *before* adding its own cost, since a request cannot
//! finish before the slowest stage still ahead of it.
//!
//! ## Shared State
//!
//! Stages keep their name, successor and context in a [`StageLink`]. The
//! default trait methods forward through it, so a concrete stage only
//! overrides the operations it actually handles.

use std::fmt;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use super::context::StreamerContext;
use super::request::FileRequest;
use super::statistics::Statistic;
use crate::common::exception::RequestError;
use crate::common::time::Timestamp;

/// Shared, rebindable reference to a stage. The stack is the authoritative
/// owner; predecessors and diagnostic tooling hold clones.
pub type StageRef = Arc<Mutex<dyn StreamStage>>;

pub fn stage_ref<S: StreamStage + 'static>(stage: S) -> StageRef {
    Arc::new(Mutex::new(stage))
}

/// Aggregated admission state of a chain of stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Positive: more requests may be admitted. Zero or negative: apply
    /// backpressure (negative means oversaturated).
    pub available_slots: i32,

    /// True only if no stage has pending or in-flight work
    pub is_idle: bool,
}

impl Status {
    /// Starting point of a fold, capped at the stack's configured concurrency
    pub fn new(max_slots: i32) -> Self {
        Self {
            available_slots: max_slots,
            is_idle: true,
        }
    }

    /// Folds one stage's local state into the aggregate
    pub fn fold(&mut self, available_slots: i32, is_idle: bool) {
        self.available_slots = self.available_slots.min(available_slots);
        self.is_idle = self.is_idle && is_idle;
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(i32::MAX)
    }
}

/// Name, successor and context of a stage
pub struct StageLink {
    name: String,
    next: Option<StageRef>,
    context: Option<Arc<StreamerContext>>,
}

impl StageLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next: None,
            context: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next(&self) -> Option<&StageRef> {
        self.next.as_ref()
    }

    pub fn set_next(&mut self, next: Option<StageRef>) {
        self.next = next;
    }

    pub fn context(&self) -> Option<&Arc<StreamerContext>> {
        self.context.as_ref()
    }

    pub fn set_context(&mut self, context: Arc<StreamerContext>) {
        if let Some(current) = &self.context
            && !Arc::ptr_eq(current, &context)
        {
            error!(
                "Stage '{}' was attached to a second context; rebinding",
                self.name
            );
        }
        self.context = Some(context);
    }

    /// Hands `request` to the next stage's `prepare_request`, or fails it if
    /// this is the end of the chain.
    pub fn forward_prepare(&self, request: Arc<FileRequest>) {
        match &self.next {
            Some(next) => next.lock().prepare_request(request),
            None => self.fail_unhandled(&request),
        }
    }

    pub fn forward_queue(&self, request: Arc<FileRequest>) {
        match &self.next {
            Some(next) => next.lock().queue_request(request),
            None => self.fail_unhandled(&request),
        }
    }

    pub fn forward_execute(&self) -> bool {
        self.next
            .as_ref()
            .is_some_and(|next| next.lock().execute_requests())
    }

    pub fn forward_status(&self, status: &mut Status) {
        if let Some(next) = &self.next {
            next.lock().update_status(status);
        }
    }

    pub fn forward_estimates(
        &self,
        now: Timestamp,
        internal_pending: &mut Vec<Arc<FileRequest>>,
        pending: &[Arc<FileRequest>],
    ) {
        if let Some(next) = &self.next {
            next.lock()
                .update_completion_estimates(now, internal_pending, pending);
        }
    }

    pub fn forward_statistics(&self, statistics: &mut Vec<Statistic>) {
        if let Some(next) = &self.next {
            next.lock().collect_statistics(statistics);
        }
    }

    /// A request fell off the end of the chain. This is an assembly bug, but
    /// the request is still failed so its caller hears back.
    fn fail_unhandled(&self, request: &Arc<FileRequest>) {
        error!(
            "Request {} ({}) reached '{}' with no stage left to handle it",
            request.id(),
            request.command().name(),
            self.name
        );
        match &self.context {
            Some(context) => context.fail_request(
                request,
                RequestError::Unhandled {
                    stage: self.name.clone(),
                    request: request.id(),
                },
            ),
            None => error!(
                "Stage '{}' has no context; request {} cannot be settled",
                self.name,
                request.id()
            ),
        }
    }
}

impl fmt::Debug for StageLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let next = self.next.as_ref().map(|next| next.lock().name().to_string());
        f.debug_struct("StageLink")
            .field("name", &self.name)
            .field("next", &next)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// One link in the I/O processing chain.
///
/// Dispatch is purely through this trait; no stage needs to know the concrete
/// type of its neighbours.
pub trait StreamStage: Send {
    fn link(&self) -> &StageLink;

    fn link_mut(&mut self) -> &mut StageLink;

    fn name(&self) -> &str {
        self.link().name()
    }

    /// Rebinds the successor. Only safe between ticks while the stack is idle.
    fn set_next(&mut self, next: Option<StageRef>) {
        self.link_mut().set_next(next);
    }

    fn next(&self) -> Option<StageRef> {
        self.link().next().cloned()
    }

    /// Called once at assembly
    fn set_context(&mut self, context: Arc<StreamerContext>) {
        self.link_mut().set_context(context);
    }

    /// Accepts a request and either translates it into zero or more internal
    /// requests, pushes it to the prepared queue, or forwards the original
    /// unmodified.
    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        self.link().forward_prepare(request);
    }

    /// Takes a prepared request into this stage's own queue, or forwards it.
    /// Must not block.
    fn queue_request(&mut self, request: Arc<FileRequest>) {
        self.link().forward_queue(request);
    }

    /// Advances this stage's asynchronous work by one increment. Returns true
    /// if anything moved, here or further down the chain.
    fn execute_requests(&mut self) -> bool {
        self.link().forward_execute()
    }

    fn update_status(&self, status: &mut Status) {
        self.link().forward_status(status);
    }

    /// `pending` holds requests still waiting for a processing slot, oldest
    /// first. `internal_pending` collects requests that stages above are
    /// holding back, in top-to-bottom order.
    fn update_completion_estimates(
        &mut self,
        now: Timestamp,
        internal_pending: &mut Vec<Arc<FileRequest>>,
        pending: &[Arc<FileRequest>],
    ) {
        self.link()
            .forward_estimates(now, internal_pending, pending);
    }

    /// Diagnostics only
    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        self.link().forward_statistics(statistics);
    }
}
