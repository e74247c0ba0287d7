//! # Request Status
//!
//! State machine for a single request as it moves through a stream stack.
//!
//! ## State Machine
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────────────┐
//!   │                           RequestStatus                                  │
//!   │                                                                          │
//!   │   Created ──► Prepared ──► Queued ──► Executing                          │
//!   │      │           │           ▲   │        │                              │
//!   │      │           │           └───┼────────┘ requeue (transient error)    │
//!   │      │           │               │        │                              │
//!   │      └───────────┴───────────────┴────────┼──► Completed                 │
//!   │                                           ├──► Failed(RequestError)      │
//!   │                                           ├──► Cancelled                 │
//!   │                                           └──► TimedOut                  │
//!   │                                                                          │
//!   │   Any non-terminal state may settle into any terminal state. Terminal    │
//!   │   states never change again.                                             │
//!   └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reply Values
//!
//! | Command        | Reply on success            |
//! |----------------|-----------------------------|
//! | `Read`         | `BytesRead(n)`              |
//! | `FileExists`   | `Exists(bool)`              |
//! | `FileMetaData` | `FileSize(n)`               |
//! | `Flush*`       | `Done`                      |

use std::fmt;

use crate::common::exception::RequestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Prepared,
    Queued,
    Executing,
    Completed,
    Failed(RequestError),
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    /// Position along the linear part of the lifecycle. All terminal states
    /// share the last rank.
    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Prepared => 1,
            Self::Queued => 2,
            Self::Executing => 3,
            Self::Completed | Self::Failed(_) | Self::Cancelled | Self::TimedOut => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// True for the two "gave up" outcomes.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut)
    }

    pub fn error(&self) -> Option<&RequestError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Returns true if moving to `next` goes forward along the lifecycle.
    pub(crate) fn can_advance_to(&self, next: &RequestStatus) -> bool {
        !self.is_terminal() && !next.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Prepared => write!(f, "prepared"),
            Self::Queued => write!(f, "queued"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed(error) => write!(f, "failed ({})", error),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Value produced by a successfully completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReply {
    BytesRead(u64),
    Exists(bool),
    FileSize(u64),
    Done,
}

impl RequestReply {
    /// Folds a child's reply into the reply of its parent. Byte counts add up,
    /// anything else is taken from the child.
    pub(crate) fn merge(current: Option<RequestReply>, child: RequestReply) -> RequestReply {
        match (current, child) {
            (Some(RequestReply::BytesRead(a)), RequestReply::BytesRead(b)) => {
                RequestReply::BytesRead(a + b)
            }
            (_, child) => child,
        }
    }
}
