use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::codec::Value;
use crate::driver::options::KeepOpen;
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::{RequestId, RequestKey, WorkerId};
use crate::module::ModuleHandle;

pub(crate) struct CallRequest {
    pub key: RequestKey,
    pub module: String,
    pub method: String,
    pub args: Vec<Value>,
    pub keep_open: KeepOpen,
    pub resubmit_on_crash: bool,
    pub result: oneshot::Sender<ExecutionResult<Value>>,
}

impl CallRequest {
    /// Whether the caller has stopped waiting for the result.
    pub fn is_abandoned(&self) -> bool {
        self.result.is_closed()
    }

    pub fn resolve(self, result: ExecutionResult<Value>) {
        let _ = self.result.send(result);
    }
}

pub(crate) struct LoadWaiter {
    pub key: RequestKey,
    pub result: oneshot::Sender<ExecutionResult<ModuleHandle>>,
}

impl LoadWaiter {
    pub fn resolve(self, result: ExecutionResult<ModuleHandle>) {
        let _ = self.result.send(result);
    }
}

/// Where a module load stands before any worker has reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadStage {
    /// The dispatch is scheduled for a later turn of the pool.
    Pending,
    /// No worker could take the load, so it waits in the load queue.
    Queued,
    /// The load has been handed to a worker under this request ID.
    Dispatched {
        worker_id: WorkerId,
        id: RequestId,
    },
}

/// All load requests for one module that have not been resolved yet.
/// There is at most one group per module, and each group occupies
/// at most one slot on one worker no matter how many callers wait on it.
pub(crate) struct LoadGroup {
    pub waiters: Vec<LoadWaiter>,
    pub stage: LoadStage,
}

impl LoadGroup {
    pub fn resolve(self, handle: &ModuleHandle) {
        for waiter in self.waiters {
            waiter.resolve(Ok(handle.clone()));
        }
    }

    pub fn reject(self, error: impl Fn() -> ExecutionError) {
        for waiter in self.waiters {
            waiter.resolve(Err(error()));
        }
    }
}

/// A consistent view of the pool at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// The number of workers that are ready.
    pub total: usize,
    /// The number of workers that are ready or being launched.
    pub spawned: usize,
    /// The number of requests waiting for a worker.
    pub queued: usize,
    /// The number of requests assigned to workers.
    pub running: usize,
    pub workers: Vec<WorkerStats>,
    /// The method arities of every module cached in the pool.
    pub modules: BTreeMap<String, BTreeMap<String, usize>>,
    /// The modules with load requests that have not completed.
    pub loading: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub running: usize,
    /// The modules loaded in the worker.
    pub modules: Vec<String>,
    /// Whether the worker is stopping and no longer accepts work.
    pub draining: bool,
    pub loads: usize,
    pub calls: usize,
    pub total_loads: usize,
    pub total_calls: usize,
}
