//! # Stream Stack
//!
//! An ordered chain of stages, assembled once at startup, presented as a
//! single stage. Every operation is delegated to the head; the head forwards
//! down the chain through each stage's own link.
//!
//! ```text
//!   StreamStack "drive-0"
//!   ┌────────────────────────────────────────────────────────────────────┐
//!   │   head                                                tail         │
//!   │   ┌──────────┐      ┌──────────┐      ┌──────────┐                 │
//!   │   │ splitter │ ───► │  cache   │ ───► │  drive   │ ───► stack.next │
//!   │   └──────────┘      └──────────┘      └──────────┘    (if bound)   │
//!   └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Because the stack is itself a [`StreamStage`], stacks nest: a routing stage
//! can hold one sub-stack per device.
//!
//! Rebinding (`push_back`, `remove`, `set_next`) is only done while the stack
//! reports idle.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use super::context::StreamerContext;
use super::request::FileRequest;
use super::stage::{StageLink, StageRef, Status, StreamStage};
use super::statistics::Statistic;
use crate::common::exception::AssemblyError;
use crate::common::time::Timestamp;

fn same_stage(a: &StageRef, b: &StageRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub struct StreamStack {
    link: StageLink,
    stages: Vec<StageRef>,
}

impl StreamStack {
    /// Links `stages` in order. Fails on an empty chain, on two stages with
    /// the same name, or on the same stage instance appearing twice.
    pub fn new(name: impl Into<String>, stages: Vec<StageRef>) -> Result<Self, AssemblyError> {
        let name = name.into();
        if stages.is_empty() {
            return Err(AssemblyError::EmptyStack(name));
        }

        let mut names: Vec<String> = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            if stages[..index].iter().any(|seen| same_stage(seen, stage)) {
                return Err(AssemblyError::DuplicateStage(stage.lock().name().to_string()));
            }
            let stage_name = stage.lock().name().to_string();
            if names.contains(&stage_name) {
                return Err(AssemblyError::DuplicateName(stage_name));
            }
            names.push(stage_name);
        }

        for pair in stages.windows(2) {
            pair[0].lock().set_next(Some(Arc::clone(&pair[1])));
        }
        if let Some(tail) = stages.last() {
            tail.lock().set_next(None);
        }

        info!("Assembled stack '{}': {}", name, names.join(" -> "));
        Ok(Self {
            link: StageLink::new(name),
            stages,
        })
    }

    pub fn head(&self) -> &StageRef {
        &self.stages[0]
    }

    fn tail(&self) -> &StageRef {
        &self.stages[self.stages.len() - 1]
    }

    pub fn stages(&self) -> &[StageRef] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|stage| stage.lock().name().to_string())
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<StageRef> {
        self.stages
            .iter()
            .find(|stage| stage.lock().name() == name)
            .cloned()
    }

    pub fn is_idle(&self) -> bool {
        let mut status = Status::default();
        self.update_status(&mut status);
        status.is_idle
    }

    fn ensure_idle(&self) -> Result<(), AssemblyError> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(AssemblyError::NotIdle(self.link.name().to_string()))
        }
    }

    /// Appends `stage` behind the current tail
    pub fn push_back(&mut self, stage: StageRef) -> Result<(), AssemblyError> {
        self.ensure_idle()?;
        let stage_name = stage.lock().name().to_string();
        if self.stages.iter().any(|existing| same_stage(existing, &stage)) {
            return Err(AssemblyError::DuplicateStage(stage_name));
        }
        if self.find(&stage_name).is_some() {
            return Err(AssemblyError::DuplicateName(stage_name));
        }

        {
            let mut new_tail = stage.lock();
            new_tail.set_next(self.link.next().cloned());
            if let Some(context) = self.link.context() {
                new_tail.set_context(Arc::clone(context));
            }
        }
        self.tail().lock().set_next(Some(Arc::clone(&stage)));
        self.stages.push(stage);
        debug!("Stack '{}' appended '{}'", self.link.name(), stage_name);
        Ok(())
    }

    /// Unlinks the stage called `name` and returns it
    pub fn remove(&mut self, name: &str) -> Result<StageRef, AssemblyError> {
        self.ensure_idle()?;
        let index = self
            .stages
            .iter()
            .position(|stage| stage.lock().name() == name)
            .ok_or_else(|| AssemblyError::StageNotFound(name.to_string()))?;
        if self.stages.len() == 1 {
            return Err(AssemblyError::LastStage(name.to_string()));
        }

        let removed = self.stages.remove(index);
        let successor = removed.lock().next();
        if index > 0 {
            self.stages[index - 1].lock().set_next(successor);
        }
        removed.lock().set_next(None);
        debug!("Stack '{}' removed '{}'", self.link.name(), name);
        Ok(removed)
    }
}

impl StreamStage for StreamStack {
    fn link(&self) -> &StageLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StageLink {
        &mut self.link
    }

    /// Binds the stack's tail. Must only happen while idle.
    fn set_next(&mut self, next: Option<StageRef>) {
        if !self.is_idle() {
            warn!(
                "Rebinding the tail of stack '{}' while it still has work in flight",
                self.link.name()
            );
        }
        self.link.set_next(next.clone());
        self.tail().lock().set_next(next);
    }

    fn next(&self) -> Option<StageRef> {
        self.link.next().cloned()
    }

    fn set_context(&mut self, context: Arc<StreamerContext>) {
        for stage in &self.stages {
            stage.lock().set_context(Arc::clone(&context));
        }
        self.link.set_context(context);
    }

    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        self.head().lock().prepare_request(request);
    }

    fn queue_request(&mut self, request: Arc<FileRequest>) {
        self.head().lock().queue_request(request);
    }

    fn execute_requests(&mut self) -> bool {
        self.head().lock().execute_requests()
    }

    fn update_status(&self, status: &mut Status) {
        self.head().lock().update_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Timestamp,
        internal_pending: &mut Vec<Arc<FileRequest>>,
        pending: &[Arc<FileRequest>],
    ) {
        self.head()
            .lock()
            .update_completion_estimates(now, internal_pending, pending);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        self.head().lock().collect_statistics(statistics);
    }
}

impl fmt::Debug for StreamStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStack")
            .field("name", &self.link.name())
            .field("stages", &self.stage_names())
            .finish()
    }
}
