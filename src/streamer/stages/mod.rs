//! Reference stages. A typical stack is
//! `ReadSplitter -> ReadCache -> StorageDrive`.

pub mod read_cache;
pub mod read_splitter;
pub mod storage_drive;

pub use read_cache::ReadCache;
pub use read_splitter::ReadSplitter;
pub use storage_drive::{DriveBackend, DriveFuture, LocalFileBackend, StorageDrive};
