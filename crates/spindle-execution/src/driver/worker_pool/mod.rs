mod core;
mod options;
mod state;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

pub(crate) use options::WorkerPoolOptions;
use state::WorkerDescriptor;

use crate::driver::client::PoolShared;
use crate::driver::state::{CallRequest, LoadGroup, LoadWaiter};
use crate::id::{IdAllocator, IdGenerator, RequestKey, WorkerId};
use crate::module::ModuleHandle;
use crate::worker_manager::WorkerManager;

/// The scheduling state of the pool.
///
/// The pool owns the workers and the queues of requests waiting for a worker,
/// and caches a handle for every module loaded successfully.
pub(crate) struct WorkerPool {
    options: WorkerPoolOptions,
    shared: Arc<PoolShared>,
    worker_manager: Arc<dyn WorkerManager>,
    workers: BTreeMap<WorkerId, WorkerDescriptor>,
    worker_id_generator: IdGenerator<WorkerId>,
    /// The request IDs in use across all workers.
    request_ids: IdAllocator,
    /// The number of workers that are ready or being launched.
    spawned: usize,
    /// The number of workers being launched that no request has claimed yet.
    waiting: usize,
    load_queue: VecDeque<String>,
    call_queue: VecDeque<CallRequest>,
    cache: BTreeMap<String, ModuleHandle>,
    loading: HashMap<String, LoadGroup>,
    /// Loads of cached modules that are resolved on the next turn.
    cached_loads: HashMap<RequestKey, LoadWaiter>,
    closing: bool,
}

impl WorkerPool {
    pub fn new(shared: Arc<PoolShared>, worker_manager: Arc<dyn WorkerManager>) -> Self {
        Self {
            options: WorkerPoolOptions::from(&shared.options),
            shared,
            worker_manager,
            workers: BTreeMap::new(),
            worker_id_generator: IdGenerator::new(),
            request_ids: IdAllocator::new(),
            spawned: 0,
            waiting: 0,
            load_queue: VecDeque::new(),
            call_queue: VecDeque::new(),
            cache: BTreeMap::new(),
            loading: HashMap::new(),
            cached_loads: HashMap::new(),
            closing: false,
        }
    }
}
