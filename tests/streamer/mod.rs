mod scheduler;
mod service;
mod stack;
mod storage_drive;
