//! Layered asynchronous file I/O scheduling.
//!
//! Requests flow through a [`StreamStack`](streamer::StreamStack): a chain of
//! stages that each either service a request, split it into sub-requests, or
//! hand it to the next stage. A [`Scheduler`](streamer::Scheduler) drives the
//! stack one tick at a time (prepare, queue, execute, status, estimate) and
//! the [`Streamer`](streamer::Streamer) runs that loop on its own thread.

pub mod common;
pub mod streamer;
