//! # Scheduler
//!
//! Drives one stream stack, one tick at a time. A tick owns the whole pass
//! and is not re-entrant (`tick` takes `&mut self`).
//!
//! ## Tick
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────────────┐
//!   │ 1. prepare   take_submissions ─► checkpoint ─► stack.prepare_request     │
//!   │ 2. queue     while slots > 0: pop_prepared ─► checkpoint ─► queue_request│
//!   │ 3. execute   stack.execute_requests + finalize, ≤ max_execute_passes     │
//!   │ 4. status    Status::new(max) ─► stack.update_status ─► fold context     │
//!   │ 5. estimate  stack.update_completion_estimates(now, [], prepared)        │
//!   │ 6. publish   RwLock<Status> ◄── one copy                                 │
//!   └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests that do not get a slot in step 2 stay in the prepared queue and
//! are handed to estimation as the pending range, oldest first.

use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::RwLock;

use super::config::StreamerConfig;
use super::context::StreamerContext;
use super::stack::StreamStack;
use super::stage::{Status, StreamStage};
use super::statistics::Statistic;
use crate::common::exception::ConfigError;

const SCHEDULER_NAME: &str = "Scheduler";

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// External requests drained from the submission queue
    pub submitted: usize,
    /// Prepared requests handed to the stack
    pub admitted: usize,
    /// Execute passes run
    pub execute_passes: usize,
    /// True if any stage advanced work or any request was finalised
    pub progressed: bool,
    pub status: Status,
}

pub struct Scheduler {
    stack: StreamStack,
    context: Arc<StreamerContext>,
    config: StreamerConfig,
    published: Arc<RwLock<Status>>,
    ticks: u64,
}

impl Scheduler {
    /// Attaches `context` to every stage of `stack` and publishes the
    /// initial status.
    pub fn new(
        mut stack: StreamStack,
        context: Arc<StreamerContext>,
        config: StreamerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        stack.set_context(Arc::clone(&context));

        let scheduler = Self {
            stack,
            context,
            published: Arc::new(RwLock::new(Status::new(config.max_slots()))),
            config,
            ticks: 0,
        };
        let status = scheduler.compute_status();
        *scheduler.published.write() = status;

        info!(
            "Scheduler ready for stack '{}' with {} slots",
            scheduler.stack.name(),
            scheduler.config.max_concurrent_requests
        );
        Ok(scheduler)
    }

    pub fn context(&self) -> &Arc<StreamerContext> {
        &self.context
    }

    pub fn stack(&self) -> &StreamStack {
        &self.stack
    }

    /// Mutable access for rebinding between ticks
    pub fn stack_mut(&mut self) -> &mut StreamStack {
        &mut self.stack
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Last published status. Never waits on a running tick.
    pub fn status(&self) -> Status {
        *self.published.read()
    }

    pub(crate) fn published_status(&self) -> Arc<RwLock<Status>> {
        Arc::clone(&self.published)
    }

    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let mut progressed = false;

        let submitted = self.prepare_submissions();
        progressed |= self.context.finalize_completed_requests();

        let admitted = self.admit_prepared();

        let mut execute_passes = 0;
        while execute_passes < self.config.max_execute_passes {
            execute_passes += 1;
            let executed = self.stack.execute_requests();
            let finalized = self.context.finalize_completed_requests();
            if !executed && !finalized {
                break;
            }
            progressed = true;
        }

        let status = self.compute_status();
        self.update_estimates();
        *self.published.write() = status;

        progressed |= submitted > 0 || admitted > 0;
        trace!(
            "Tick {}: {} submitted, {} admitted, {} execute passes, slots {}, idle {}",
            self.ticks,
            submitted,
            admitted,
            execute_passes,
            status.available_slots,
            status.is_idle
        );

        TickReport {
            submitted,
            admitted,
            execute_passes,
            progressed,
            status,
        }
    }

    /// Ticks until the stack reports idle or `max_ticks` have run. Returns
    /// whether idle was reached.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> bool {
        for _ in 0..max_ticks {
            if self.tick().status.is_idle {
                return true;
            }
        }
        self.status().is_idle
    }

    fn prepare_submissions(&mut self) -> usize {
        let submissions = self.context.take_submissions();
        let count = submissions.len();
        for request in submissions {
            if self.context.reject_if_abandoned(&request) {
                continue;
            }
            self.stack.prepare_request(request);
        }
        count
    }

    /// Moves prepared requests into the stack, best first, while the stack
    /// reports free slots. Status is refolded after every admission so a
    /// stage that saturates stops admission immediately.
    fn admit_prepared(&mut self) -> usize {
        let mut admitted = 0;
        loop {
            let slots = self.fold_stack_status().available_slots;
            if slots <= 0 {
                if self.context.prepared_len() > 0 {
                    debug!(
                        "Backpressure: {} prepared requests waiting, {} slots",
                        self.context.prepared_len(),
                        slots
                    );
                }
                break;
            }
            let Some(request) = self.context.pop_prepared_request() else {
                break;
            };
            if self.context.reject_if_abandoned(&request) {
                continue;
            }
            self.stack.queue_request(request);
            admitted += 1;
        }
        admitted
    }

    fn fold_stack_status(&self) -> Status {
        let mut status = Status::new(self.config.max_slots());
        self.stack.update_status(&mut status);
        status
    }

    fn compute_status(&self) -> Status {
        let mut status = self.fold_stack_status();
        status.is_idle = status.is_idle
            && self.context.prepared_len() == 0
            && !self.context.has_submissions()
            && !self.context.has_completed();
        status
    }

    fn update_estimates(&mut self) {
        let pending = self.context.prepared_snapshot();
        let mut internal_pending = Vec::new();
        let now = self.context.now();
        self.stack
            .update_completion_estimates(now, &mut internal_pending, &pending);
    }

    /// Scheduler, context and stage statistics, in that order
    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let status = self.status();
        let mut statistics = vec![
            Statistic::text(SCHEDULER_NAME, "Stack", self.stack.name()),
            Statistic::integer(SCHEDULER_NAME, "Ticks", self.ticks as i64),
            Statistic::integer(
                SCHEDULER_NAME,
                "Available slots",
                status.available_slots as i64,
            ),
            Statistic::boolean(SCHEDULER_NAME, "Idle", status.is_idle),
        ];
        self.context.collect_statistics(&mut statistics);
        self.stack.collect_statistics(&mut statistics);
        statistics
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("stack", &self.stack)
            .field("config", &self.config)
            .field("ticks", &self.ticks)
            .field("status", &self.status())
            .finish()
    }
}
