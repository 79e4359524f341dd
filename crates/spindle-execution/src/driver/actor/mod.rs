mod core;
mod handler;

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::driver::client::PoolShared;
use crate::driver::worker_pool::WorkerPool;
use crate::error::ExecutionResult;
use crate::worker_manager::WorkerManager;

pub(crate) struct DriverOptions {
    pub shared: Arc<PoolShared>,
    pub worker_manager: Arc<dyn WorkerManager>,
}

pub(crate) struct DriverActor {
    worker_manager: Arc<dyn WorkerManager>,
    worker_pool: WorkerPool,
    /// The callers waiting for the pool to shut down.
    shutdown: Vec<oneshot::Sender<ExecutionResult<()>>>,
}
