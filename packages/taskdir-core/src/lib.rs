pub mod codec;
pub mod config;
pub mod coordinator;
pub mod ordering;
pub mod storage;
pub mod types;
pub mod watcher;

#[cfg(feature = "file-watcher")]
pub mod broadcast;
