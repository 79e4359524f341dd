mod actor;
mod client;
mod coordinator;
mod event;
mod options;
mod state;
mod worker_pool;

pub use client::Pool;
pub use options::{CallOptions, ErrorHandler, KeepOpen, LoadOptions, PoolOptions};
pub use state::{PoolSnapshot, WorkerStats};
