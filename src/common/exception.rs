use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::common::config::RequestId;

/// Why a request ended in the `Failed` state.
///
/// These are recorded on the request itself and never returned across a stage
/// boundary; the submitting caller maps them onto its own domain errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("read of {size} bytes at offset {offset} is outside {}", .path.display())]
    OutOfRange { path: PathBuf, offset: u64, size: u64 },
    #[error("read of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("corrupt data in {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("stage '{stage}' does not support {command} requests")]
    Unsupported { stage: String, command: &'static str },
    #[error("request {request} reached the end of the chain at '{stage}' without being handled")]
    Unhandled { stage: String, request: RequestId },
    #[error("gave up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
    #[error("I/O error: {0}")]
    Io(String),
}

impl RequestError {
    /// Maps a permanent I/O failure on `path` to a request error.
    pub fn from_io(error: &io::Error, path: &std::path::Path, offset: u64, size: u64) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => RequestError::NotFound(path.to_path_buf()),
            io::ErrorKind::UnexpectedEof => RequestError::OutOfRange {
                path: path.to_path_buf(),
                offset,
                size,
            },
            io::ErrorKind::InvalidData => RequestError::Corrupt {
                path: path.to_path_buf(),
                reason: error.to_string(),
            },
            _ => RequestError::Io(error.to_string()),
        }
    }
}

/// Returns true for I/O errors worth retrying on a later tick.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Construction and rebinding bugs. These abort the assembly step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("stack '{0}' has no stages")]
    EmptyStack(String),
    #[error("stage name '{0}' is used more than once in the stack")]
    DuplicateName(String),
    #[error("stage '{0}' appears more than once in the stack")]
    DuplicateStage(String),
    #[error("stack '{0}' can only be rebound while idle")]
    NotIdle(String),
    #[error("no stage named '{0}' in the stack")]
    StageNotFound(String),
    #[error("removing '{0}' would leave the stack empty")]
    LastStage(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures starting the background streamer
#[derive(Error, Debug)]
pub enum StreamerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] io::Error),
}
