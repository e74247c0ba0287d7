pub mod cache;
pub mod config;
pub mod context;
pub mod request;
pub mod request_status;
pub mod scheduler;
pub mod service;
pub mod stack;
pub mod stage;
pub mod stages;
pub mod statistics;

pub use context::StreamerContext;
pub use request::{FileRequest, RequestBuilder, RequestCommand, RequestHandle, RequestPriority};
pub use request_status::{RequestReply, RequestStatus};
pub use scheduler::{Scheduler, TickReport};
pub use service::Streamer;
pub use stack::StreamStack;
pub use stage::{StageLink, StageRef, Status, StreamStage, stage_ref};
