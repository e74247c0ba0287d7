//! # File Requests
//!
//! The unit of work flowing through a stream stack. A request couples an
//! immutable description of *what* to do (command, priority, deadline, output
//! buffer) with mutable bookkeeping that stages update while they hold it.
//!
//! ## Architecture
//!
//! ```text
//!   Caller
//!   ═══════════════════════════════════════════════════════════════════════════
//!          │
//!          │ RequestBuilder::read(path, offset, size, buffer)
//!          │     .priority(High).deadline(t).on_complete(cb)
//!          ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │                          FileRequest                                    │
//!   │                                                                         │
//!   │   immutable:  id · command · priority · deadline · output · parent      │
//!   │                                                                         │
//!   │   mutable (one short lock):                                             │
//!   │     status · reply · estimated_completion · retries                     │
//!   │     pending_children · child outcome flags                              │
//!   │     callback (caller) · hook (stage, internal requests only)            │
//!   │                                                                         │
//!   │   atomic:     cancel_requested                                          │
//!   └─────────────────────────────────────────────────────────────────────────┘
//!          │
//!          │ Stages may derive internal children:
//!          ▼
//!   ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//!   │ child (read 0)  │   │ child (read 1)  │   │ child (read 2)  │
//!   │ parent ─────────┼───┼─────────────────┼───┼──► original     │
//!   └─────────────────┘   └─────────────────┘   └─────────────────┘
//! ```
//!
//! A parent settles once its last child settles. Completion is one-shot: the
//! first terminal transition wins, and the callback is taken out of the request
//! so it cannot run twice no matter how many stages still hold a reference.
//!
//! ## Ordering
//!
//! | Key        | Direction            |
//! |------------|----------------------|
//! | `priority` | higher served first  |
//! | `id`       | lower (older) first  |

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::request_status::{RequestReply, RequestStatus};
use crate::common::config::RequestId;
use crate::common::exception::RequestError;
use crate::common::time::Timestamp;

/// Caller-owned output buffer. The pipeline only ever writes into it.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Caller continuation, invoked at most once with the settled request.
pub type CompletionCallback = Box<dyn FnOnce(&FileRequest) + Send + 'static>;

/// Stage continuation attached to an internal request. Runs on the scheduler
/// thread before the parent is updated.
pub type CompletionHook = Box<dyn FnOnce(&FileRequest) + Send + 'static>;

pub fn shared_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Priority levels for requests
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RequestPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// What a request asks the stack to do
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestCommand {
    /// Read `size` bytes starting at `offset` into the output buffer
    Read { path: PathBuf, offset: u64, size: u64 },

    /// Check whether a file exists
    FileExists { path: PathBuf },

    /// Retrieve the size of a file
    FileMetaData { path: PathBuf },

    /// Drop anything cached for a file
    Flush { path: PathBuf },

    /// Drop everything cached
    FlushAll,
}

impl RequestCommand {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. }
            | Self::FileExists { path }
            | Self::FileMetaData { path }
            | Self::Flush { path } => Some(path),
            Self::FlushAll => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::FileExists { .. } => "file-exists",
            Self::FileMetaData { .. } => "file-metadata",
            Self::Flush { .. } => "flush",
            Self::FlushAll => "flush-all",
        }
    }
}

struct RequestState {
    status: RequestStatus,
    reply: Option<RequestReply>,
    estimated_completion: Option<Timestamp>,
    retries: u32,
    pending_children: usize,
    child_failure: Option<RequestError>,
    child_cancelled: bool,
    child_timed_out: bool,
    callback: Option<CompletionCallback>,
    hook: Option<CompletionHook>,
}

impl RequestState {
    fn new(callback: Option<CompletionCallback>, hook: Option<CompletionHook>) -> Self {
        Self {
            status: RequestStatus::Created,
            reply: None,
            estimated_completion: None,
            retries: 0,
            pending_children: 0,
            child_failure: None,
            child_cancelled: false,
            child_timed_out: false,
            callback,
            hook,
        }
    }
}

pub struct FileRequest {
    id: RequestId,
    command: RequestCommand,
    priority: RequestPriority,
    deadline: Option<Timestamp>,
    output: Option<SharedBuffer>,
    parent: Option<Arc<FileRequest>>,
    cancel_requested: AtomicBool,
    state: Mutex<RequestState>,
}

impl FileRequest {
    pub(crate) fn new_internal(
        id: RequestId,
        parent: &Arc<FileRequest>,
        command: RequestCommand,
        output: Option<SharedBuffer>,
        hook: Option<CompletionHook>,
    ) -> Self {
        Self {
            id,
            command,
            priority: parent.priority,
            deadline: parent.deadline,
            output,
            parent: Some(Arc::clone(parent)),
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(RequestState::new(None, hook)),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn command(&self) -> &RequestCommand {
        &self.command
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn output(&self) -> Option<&SharedBuffer> {
        self.output.as_ref()
    }

    pub fn parent(&self) -> Option<&Arc<FileRequest>> {
        self.parent.as_ref()
    }

    /// True for sub-requests created by a stage rather than a caller
    pub fn is_internal(&self) -> bool {
        self.parent.is_some()
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().status.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().status.is_terminal()
    }

    pub fn reply(&self) -> Option<RequestReply> {
        self.state.lock().reply
    }

    pub fn retries(&self) -> u32 {
        self.state.lock().retries
    }

    pub fn pending_children(&self) -> usize {
        self.state.lock().pending_children
    }

    pub fn estimated_completion(&self) -> Option<Timestamp> {
        self.state.lock().estimated_completion
    }

    /// Records a projected finish time. A parent cannot finish before any of
    /// its children, so the estimate is pushed up the ancestry as a lower bound.
    pub fn set_estimated_completion(&self, at: Timestamp) {
        self.state.lock().estimated_completion = Some(at);
        if let Some(parent) = &self.parent {
            parent.raise_estimated_completion(at);
        }
    }

    fn raise_estimated_completion(&self, at: Timestamp) {
        {
            let mut state = self.state.lock();
            if state.estimated_completion.is_some_and(|current| current >= at) {
                return;
            }
            state.estimated_completion = Some(at);
        }
        if let Some(parent) = &self.parent {
            parent.raise_estimated_completion(at);
        }
    }

    /// Flags the request for cooperative cancellation. The stage holding it
    /// observes the flag at its next checkpoint.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// True if this request or any ancestor was asked to cancel
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancel_requested())
    }

    pub fn is_past_deadline(&self, now: Timestamp) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }

    /// Moves the request forward along `Created → Prepared → Queued →
    /// Executing`. Backwards moves are ignored. Parents follow their children.
    pub(crate) fn advance(&self, next: RequestStatus) {
        let advanced = {
            let mut state = self.state.lock();
            if state.status.can_advance_to(&next) {
                state.status = next.clone();
                true
            } else {
                false
            }
        };
        if advanced && let Some(parent) = &self.parent {
            parent.advance(next);
        }
    }

    /// Sends an executing request back to `Queued` after a transient failure.
    /// Returns the number of retries used so far.
    pub(crate) fn requeue(&self) -> u32 {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            state.status = RequestStatus::Queued;
            state.retries += 1;
        }
        state.retries
    }

    /// The one-shot terminal transition. Returns false if the request had
    /// already settled, in which case nothing changes.
    pub(crate) fn settle(&self, status: RequestStatus, reply: Option<RequestReply>) -> bool {
        debug_assert!(status.is_terminal(), "settle called with {}", status);
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        if reply.is_some() {
            state.reply = reply;
        }
        true
    }

    pub(crate) fn take_completion(&self) -> (Option<CompletionHook>, Option<CompletionCallback>) {
        let mut state = self.state.lock();
        (state.hook.take(), state.callback.take())
    }

    pub(crate) fn attach_child(&self) {
        self.state.lock().pending_children += 1;
    }

    /// Folds a settled child into this request. Returns the outcome for this
    /// request once the last outstanding child has settled.
    pub(crate) fn child_settled(
        &self,
        child: &FileRequest,
    ) -> Option<(RequestStatus, Option<RequestReply>)> {
        let child_status = child.status();
        let child_reply = child.reply();
        let cancel_requested = self.is_cancel_requested();

        let mut state = self.state.lock();
        match child_status {
            RequestStatus::Completed => {
                if let Some(reply) = child_reply {
                    state.reply = Some(RequestReply::merge(state.reply, reply));
                }
            }
            RequestStatus::Failed(error) => {
                if state.child_failure.is_none() {
                    state.child_failure = Some(error);
                }
            }
            RequestStatus::Cancelled => state.child_cancelled = true,
            RequestStatus::TimedOut => state.child_timed_out = true,
            _ => {}
        }

        state.pending_children = state.pending_children.saturating_sub(1);
        if state.pending_children > 0 {
            return None;
        }

        let status = if let Some(error) = state.child_failure.clone() {
            RequestStatus::Failed(error)
        } else if state.child_timed_out {
            RequestStatus::TimedOut
        } else if state.child_cancelled || cancel_requested {
            RequestStatus::Cancelled
        } else {
            RequestStatus::Completed
        };
        Some((status, state.reply))
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

/// Builds an external request. The context assigns the id on submission.
pub struct RequestBuilder {
    command: RequestCommand,
    priority: RequestPriority,
    deadline: Option<Timestamp>,
    output: Option<SharedBuffer>,
    callback: Option<CompletionCallback>,
}

impl RequestBuilder {
    pub fn new(command: RequestCommand) -> Self {
        Self {
            command,
            priority: RequestPriority::Normal,
            deadline: None,
            output: None,
            callback: None,
        }
    }

    pub fn read(path: impl Into<PathBuf>, offset: u64, size: u64, output: SharedBuffer) -> Self {
        Self::new(RequestCommand::Read {
            path: path.into(),
            offset,
            size,
        })
        .output(output)
    }

    pub fn file_exists(path: impl Into<PathBuf>) -> Self {
        Self::new(RequestCommand::FileExists { path: path.into() })
    }

    pub fn file_meta_data(path: impl Into<PathBuf>) -> Self {
        Self::new(RequestCommand::FileMetaData { path: path.into() })
    }

    pub fn flush(path: impl Into<PathBuf>) -> Self {
        Self::new(RequestCommand::Flush { path: path.into() })
    }

    pub fn flush_all() -> Self {
        Self::new(RequestCommand::FlushAll)
    }

    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn output(mut self, output: SharedBuffer) -> Self {
        self.output = Some(output);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&FileRequest) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn build(self, id: RequestId) -> FileRequest {
        FileRequest {
            id,
            command: self.command,
            priority: self.priority,
            deadline: self.deadline,
            output: self.output,
            parent: None,
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(RequestState::new(self.callback, None)),
        }
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("command", &self.command)
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Caller-side handle to a submitted request
#[derive(Debug, Clone)]
pub struct RequestHandle {
    request: Arc<FileRequest>,
}

impl RequestHandle {
    pub(crate) fn new(request: Arc<FileRequest>) -> Self {
        Self { request }
    }

    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status()
    }

    pub fn is_done(&self) -> bool {
        self.request.is_done()
    }

    pub fn reply(&self) -> Option<RequestReply> {
        self.request.reply()
    }

    /// Latest projected finish time, or `None` once the request has settled
    /// or before the first estimate has been published.
    pub fn estimated_completion(&self) -> Option<Timestamp> {
        if self.request.is_done() {
            return None;
        }
        self.request.estimated_completion()
    }

    /// Asks the pipeline to give up on this request. Returns false if it had
    /// already settled.
    pub fn cancel(&self) -> bool {
        if self.request.is_done() {
            return false;
        }
        self.request.request_cancel();
        true
    }

    pub fn request(&self) -> &Arc<FileRequest> {
        &self.request
    }
}

/// Inserts `request` behind everything of equal or higher priority, which
/// keeps arrival order stable among equals.
pub fn enqueue_by_priority(queue: &mut VecDeque<Arc<FileRequest>>, request: Arc<FileRequest>) {
    let priority = request.priority();
    match queue.iter().position(|queued| queued.priority() < priority) {
        Some(index) => queue.insert(index, request),
        None => queue.push_back(request),
    }
}
