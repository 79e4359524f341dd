use std::collections::hash_map::Entry;
use std::sync::Arc;

use fastrace::collector::SpanContext;
use fastrace::future::FutureExt;
use fastrace::Span;
use log::{error, info, warn};
use spindle_server::actor::ActorContext;
use spindle_telemetry::common::SpanAttribute;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::driver::actor::DriverActor;
use crate::driver::client::Pool;
use crate::driver::coordinator::{AbandonedRequest, Coordinator, LoadOutcome};
use crate::driver::event::{DriverEvent, DriverWorkerListener};
use crate::driver::state::{CallRequest, LoadGroup, LoadStage, LoadWaiter, PoolSnapshot};
use crate::driver::worker_pool::state::{WorkerDescriptor, WorkerState};
use crate::driver::worker_pool::WorkerPool;
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::{RequestId, RequestKey, WorkerId};
use crate::module::ModuleHandle;
use crate::protocol::{Envelope, Reply};
use crate::worker_manager::WorkerTransport;

const POOL_CLOSED: &str = "the worker pool is closed";

impl WorkerPool {
    pub fn start(&mut self, ctx: &mut ActorContext<DriverActor>) {
        for _ in 0..self.options.minimum {
            self.start_worker(ctx);
            self.waiting += 1;
        }
    }

    fn start_worker(&mut self, ctx: &mut ActorContext<DriverActor>) {
        let Ok(worker_id) = self.worker_id_generator.next() else {
            error!("failed to generate worker IDs");
            return;
        };
        self.spawned += 1;
        info!("launching worker {worker_id}");
        // Each worker launch gets its own trace, since the launch outlives
        // the request that triggered it.
        let span = Span::root("WorkerPool::start_worker", SpanContext::random())
            .with_property(|| (SpanAttribute::POOL_WORKER_ID, worker_id.to_string()));
        let worker_manager = Arc::clone(&self.worker_manager);
        let options = self.options.launch.clone();
        let strategy = self.options.launch_retry_strategy.clone();
        let timeout = self.options.launch_timeout;
        let handle = ctx.handle().clone();
        ctx.spawn(
            async move {
                let result = strategy
                    .run(|| {
                        let worker_manager = Arc::clone(&worker_manager);
                        let options = options.clone();
                        async move {
                            match tokio::time::timeout(
                                timeout,
                                worker_manager.launch_worker(worker_id, options),
                            )
                            .await
                            {
                                Ok(x) => x,
                                Err(_) => Err(ExecutionError::WorkerLaunchError(format!(
                                    "worker {worker_id} did not start within {timeout:?}"
                                ))),
                            }
                        }
                    })
                    .await;
                let _ = handle.send(DriverEvent::WorkerLaunched { worker_id, result });
            }
            .in_span(span),
        );
    }

    pub fn handle_worker_launched(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        result: ExecutionResult<Box<dyn WorkerTransport>>,
    ) {
        self.waiting = self.waiting.saturating_sub(1);
        match result {
            Ok(transport) => {
                if self.closing {
                    drop(transport);
                    self.stop_worker(ctx, worker_id);
                    return;
                }
                let mut coordinator = Coordinator::new(worker_id, transport);
                coordinator.attach(Box::new(DriverWorkerListener::new(
                    worker_id,
                    ctx.handle().clone(),
                )));
                info!("worker {worker_id} is ready");
                self.workers
                    .insert(worker_id, WorkerDescriptor::new(coordinator));
                self.run_next(ctx, worker_id, 1);
            }
            Err(e) => {
                self.spawned = self.spawned.saturating_sub(1);
                error!("failed to launch worker {worker_id}: {e}");
                let message = match &e {
                    ExecutionError::WorkerLaunchError(x) => x.clone(),
                    e => e.to_string(),
                };
                (self.options.error_handler)(&e);
                if self.spawned == 0 {
                    self.reject_queued(|| ExecutionError::WorkerLaunchError(message.clone()));
                }
            }
        }
    }

    /// Rejects every request waiting for a worker.
    fn reject_queued(&mut self, error: impl Fn() -> ExecutionError) {
        for request in self.call_queue.drain(..) {
            request.resolve(Err(error()));
        }
        for module in self.load_queue.drain(..) {
            if let Some(group) = self.loading.remove(&module) {
                group.reject(&error);
            }
        }
    }

    fn stop_worker(&mut self, ctx: &mut ActorContext<DriverActor>, worker_id: WorkerId) {
        let worker_manager = Arc::clone(&self.worker_manager);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            if let Err(e) = worker_manager.stop_worker(worker_id).await {
                warn!("failed to stop worker {worker_id}: {e}");
            }
            let _ = handle.send(DriverEvent::WorkerStopped { worker_id });
        });
    }

    /// Stops assigning requests to the worker and stops it.
    /// The worker is forgotten once it has stopped.
    fn retire_worker(&mut self, ctx: &mut ActorContext<DriverActor>, worker_id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            warn!("worker {worker_id} not found");
            return;
        };
        if !worker.is_running() {
            return;
        }
        worker.state = WorkerState::Draining;
        worker.coordinator.detach();
        self.spawned = self.spawned.saturating_sub(1);
        self.stop_worker(ctx, worker_id);
    }

    pub fn handle_worker_stopped(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.remove(&worker_id) {
            if worker.is_running() {
                warn!("worker {worker_id} stopped while running");
            }
        }
    }

    /// Handles a worker that exited unexpectedly or broke the protocol.
    /// The worker requests are retried on other workers when it is safe to do so.
    pub fn fail_worker(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        error: ExecutionError,
    ) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            warn!("worker {worker_id} not found");
            return;
        };
        if !worker.is_running() {
            return;
        }
        warn!("worker {worker_id} failed: {error}");
        let abandoned = worker.coordinator.abandon(&mut self.request_ids);
        self.retire_worker(ctx, worker_id);
        if !self.closing {
            while self.spawned < self.options.minimum {
                self.start_worker(ctx);
                self.waiting += 1;
            }
        }
        (self.options.error_handler)(&error);
        for request in abandoned {
            match request {
                AbandonedRequest::Load { module } => {
                    let Some(group) = self.loading.get_mut(&module) else {
                        continue;
                    };
                    let stage = group.stage;
                    match stage {
                        LoadStage::Queued => {}
                        LoadStage::Dispatched { worker_id: other, .. } if other != worker_id => {}
                        LoadStage::Pending | LoadStage::Dispatched { .. } => {
                            group.stage = LoadStage::Pending;
                            ctx.send(DriverEvent::DispatchLoad { module });
                        }
                    }
                }
                AbandonedRequest::Call { request, sent } => {
                    if !sent || request.resubmit_on_crash {
                        ctx.send(DriverEvent::Call { request });
                    } else {
                        request.resolve(Err(ExecutionError::Retry));
                    }
                }
            }
        }
    }

    /// Picks a worker for a new request, or returns `None` if the request
    /// should wait in the queue. A worker may be launched for the request.
    fn select_worker(&mut self, ctx: &mut ActorContext<DriverActor>) -> Option<WorkerId> {
        if let Some(worker_id) = self
            .workers
            .iter()
            .find(|(_, worker)| worker.is_idle())
            .map(|(worker_id, _)| *worker_id)
        {
            return Some(worker_id);
        }
        if self.waiting > 0 {
            self.waiting -= 1;
            return None;
        }
        if self.spawned < self.options.limit {
            self.start_worker(ctx);
            return None;
        }
        let cap = self.options.max_per_child;
        self.workers
            .iter()
            .filter(|(_, worker)| worker.is_running())
            .map(|(worker_id, worker)| (*worker_id, worker.coordinator.running()))
            .filter(|(_, running)| cap == 0 || *running < cap)
            .min_by_key(|(_, running)| *running)
            .map(|(worker_id, _)| worker_id)
    }

    /// Assigns queued requests to the worker, loads before calls.
    /// Without a per-worker cap, at most `slots` requests are assigned.
    fn run_next(&mut self, ctx: &mut ActorContext<DriverActor>, worker_id: WorkerId, slots: usize) {
        let cap = self.options.max_per_child;
        let mut slots = slots;
        loop {
            let Some(worker) = self.workers.get(&worker_id) else {
                return;
            };
            if !worker.is_running() {
                return;
            }
            if (cap > 0 && worker.coordinator.running() >= cap) || (cap == 0 && slots == 0) {
                break;
            }
            if let Some(module) = self.load_queue.pop_front() {
                if !matches!(
                    self.loading.get(&module),
                    Some(LoadGroup {
                        stage: LoadStage::Queued,
                        ..
                    })
                ) {
                    continue;
                }
                self.assign_load(ctx, worker_id, module);
            } else if let Some(request) = self.call_queue.pop_front() {
                if request.is_abandoned() || !self.assign_call(ctx, worker_id, request) {
                    continue;
                }
            } else {
                break;
            }
            slots = slots.saturating_sub(1);
        }
        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        if worker.is_idle() {
            ctx.send_with_delay(
                DriverEvent::ProbeIdleWorker {
                    worker_id,
                    instant: worker.updated_at,
                },
                self.options.idle_timeout,
            );
        }
    }

    pub fn probe_idle_worker(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        instant: Instant,
    ) {
        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        if !worker.is_idle() || worker.updated_at > instant {
            return;
        }
        if self.spawned <= self.options.minimum {
            return;
        }
        info!("stopping idle worker {worker_id}");
        self.retire_worker(ctx, worker_id);
    }

    fn assign_load(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        module: String,
    ) {
        let cached = self.cache.contains_key(&module);
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            warn!("worker {worker_id} not found");
            return;
        };
        worker.touch();
        match worker
            .coordinator
            .load(&mut self.request_ids, &module, cached)
        {
            Ok(id) => {
                if let Some(group) = self.loading.get_mut(&module) {
                    group.stage = LoadStage::Dispatched { worker_id, id };
                }
            }
            Err(e) => self.fail_worker(ctx, worker_id, e),
        }
    }

    /// Hands the call to the worker, and returns whether the worker took it.
    /// A call the worker cannot receive is rejected before anything is sent.
    fn assign_call(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        request: CallRequest,
    ) -> bool {
        let cached = self.cache.contains_key(&request.module);
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            warn!("worker {worker_id} not found");
            self.call_queue.push_front(request);
            return false;
        };
        if !worker.coordinator.accepts(&request) {
            request.resolve(Err(ExecutionError::invalid(format!(
                "worker {worker_id} cannot receive transferable handles"
            ))));
            return false;
        }
        worker.touch();
        if let Err(e) = worker
            .coordinator
            .call(&mut self.request_ids, request, cached)
        {
            self.fail_worker(ctx, worker_id, e);
        }
        true
    }

    pub fn load(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        key: RequestKey,
        module: String,
        result: oneshot::Sender<ExecutionResult<ModuleHandle>>,
    ) {
        let waiter = LoadWaiter { key, result };
        if self.closing {
            waiter.resolve(Err(ExecutionError::internal(POOL_CLOSED)));
            return;
        }
        if self.cache.contains_key(&module) {
            self.cached_loads.insert(key, waiter);
            ctx.send(DriverEvent::ResolveCachedLoad { key, module });
            return;
        }
        match self.loading.entry(module) {
            Entry::Occupied(mut entry) => entry.get_mut().waiters.push(waiter),
            Entry::Vacant(entry) => {
                let module = entry.key().clone();
                entry.insert(LoadGroup {
                    waiters: vec![waiter],
                    stage: LoadStage::Pending,
                });
                ctx.send(DriverEvent::DispatchLoad { module });
            }
        }
    }

    pub fn resolve_cached_load(&mut self, key: RequestKey, module: &str) {
        let Some(waiter) = self.cached_loads.remove(&key) else {
            return;
        };
        let result = self
            .cache
            .get(module)
            .cloned()
            .ok_or_else(|| ExecutionError::internal(format!("module {module} is not cached")));
        waiter.resolve(result);
    }

    pub fn dispatch_load(&mut self, ctx: &mut ActorContext<DriverActor>, module: String) {
        let Some(group) = self.loading.get_mut(&module) else {
            return;
        };
        if group.stage != LoadStage::Pending {
            return;
        }
        group.waiters.retain(|x| !x.result.is_closed());
        if group.waiters.is_empty() {
            self.loading.remove(&module);
            return;
        }
        match self.select_worker(ctx) {
            Some(worker_id) => self.assign_load(ctx, worker_id, module),
            None => {
                if let Some(group) = self.loading.get_mut(&module) {
                    group.stage = LoadStage::Queued;
                    self.load_queue.push_back(module);
                }
            }
        }
    }

    pub fn call(&mut self, ctx: &mut ActorContext<DriverActor>, request: CallRequest) {
        if self.closing {
            request.resolve(Err(ExecutionError::internal(POOL_CLOSED)));
            return;
        }
        if request.is_abandoned() {
            return;
        }
        match self.select_worker(ctx) {
            Some(worker_id) => {
                self.assign_call(ctx, worker_id, request);
            }
            None => self.call_queue.push_back(request),
        }
    }

    pub fn cancel_load(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        key: RequestKey,
        module: &str,
    ) {
        if let Some(waiter) = self.cached_loads.remove(&key) {
            waiter.resolve(Err(ExecutionError::Cancelled));
            return;
        }
        let Some(group) = self.loading.get_mut(module) else {
            return;
        };
        let Some(index) = group.waiters.iter().position(|x| x.key == key) else {
            return;
        };
        group.waiters.remove(index).resolve(Err(ExecutionError::Cancelled));
        if !group.waiters.is_empty() {
            return;
        }
        let stage = group.stage;
        self.loading.remove(module);
        match stage {
            LoadStage::Pending => {}
            LoadStage::Queued => self.load_queue.retain(|x| x != module),
            LoadStage::Dispatched { worker_id, id } => self.cancel_request(ctx, worker_id, id),
        }
    }

    pub fn cancel_call(&mut self, ctx: &mut ActorContext<DriverActor>, key: RequestKey) {
        if let Some(index) = self.call_queue.iter().position(|x| x.key == key) {
            if let Some(request) = self.call_queue.remove(index) {
                request.resolve(Err(ExecutionError::Cancelled));
            }
            return;
        }
        let found = self.workers.iter().find_map(|(worker_id, worker)| {
            worker
                .coordinator
                .find_call(key)
                .map(|id| (*worker_id, id))
        });
        if let Some((worker_id, id)) = found {
            self.cancel_request(ctx, worker_id, id);
        }
    }

    fn cancel_request(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        id: RequestId,
    ) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        match worker.coordinator.cancel(&mut self.request_ids, id) {
            Ok(0) => {}
            Ok(freed) => self.run_next(ctx, worker_id, freed),
            Err(e) => self.fail_worker(ctx, worker_id, e),
        }
    }

    pub fn handle_worker_message(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        envelope: Envelope,
    ) {
        match self.workers.get(&worker_id) {
            Some(worker) if worker.is_running() => {}
            // Messages from a worker that is going away are dropped.
            Some(_) => return,
            None => {
                warn!("received a message from unknown worker {worker_id}");
                return;
            }
        }
        let reply = match Reply::decode(envelope) {
            Ok(x) => x,
            Err(e) => return self.fail_worker(ctx, worker_id, e),
        };
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        worker.touch();
        match worker
            .coordinator
            .handle_reply(&mut self.request_ids, reply)
        {
            Ok(outcome) => {
                if let Some(load) = outcome.load {
                    self.finish_load(ctx, worker_id, load);
                }
                if outcome.freed > 0 {
                    self.run_next(ctx, worker_id, outcome.freed);
                }
            }
            Err(e) => self.fail_worker(ctx, worker_id, e),
        }
    }

    fn take_group(&mut self, module: &str) -> Option<LoadGroup> {
        let group = self.loading.remove(module)?;
        if group.stage == LoadStage::Queued {
            self.load_queue.retain(|x| x != module);
        }
        Some(group)
    }

    fn finish_load(
        &mut self,
        ctx: &mut ActorContext<DriverActor>,
        worker_id: WorkerId,
        outcome: LoadOutcome,
    ) {
        match outcome {
            LoadOutcome::Loaded {
                module,
                methods,
                wanted,
            } => {
                let handle = match (self.cache.get(&module), methods) {
                    (Some(handle), _) => handle.clone(),
                    (None, Some(methods)) if wanted => {
                        let pool = Pool::from_parts(ctx.handle().clone(), Arc::clone(&self.shared));
                        let handle = ModuleHandle::new(module.clone(), methods, pool);
                        info!("module {module} is loaded");
                        self.cache.insert(module.clone(), handle.clone());
                        handle
                    }
                    (None, None) if wanted => {
                        warn!("worker {worker_id} loaded module {module} without its methods");
                        return;
                    }
                    (None, _) => return,
                };
                if let Some(group) = self.take_group(&module) {
                    group.resolve(&handle);
                }
            }
            LoadOutcome::Failed {
                module,
                error,
                wanted,
            } => {
                if !wanted {
                    return;
                }
                info!("failed to load module {module}: {error}");
                if let Some(group) = self.take_group(&module) {
                    group.reject(|| ExecutionError::Remote(error.clone()));
                }
            }
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let workers = self
            .workers
            .values()
            .map(|x| x.coordinator.stats(!x.is_running()))
            .collect::<Vec<_>>();
        let queued = self
            .loading
            .values()
            .filter(|x| x.stage == LoadStage::Queued)
            .count()
            + self.call_queue.len();
        let mut loading = self.loading.keys().cloned().collect::<Vec<_>>();
        loading.sort();
        PoolSnapshot {
            total: self.workers.values().filter(|x| x.is_running()).count(),
            spawned: self.spawned,
            queued,
            running: workers.iter().map(|x| x.running).sum(),
            workers,
            modules: self
                .cache
                .iter()
                .map(|(name, handle)| (name.clone(), handle.methods().clone()))
                .collect(),
            loading,
        }
    }

    /// Rejects all requests and detaches from all workers.
    /// The workers are stopped by the worker manager afterward.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let error = || ExecutionError::internal(POOL_CLOSED);
        self.reject_queued(error);
        for (_, group) in self.loading.drain() {
            group.reject(error);
        }
        for (_, waiter) in self.cached_loads.drain() {
            waiter.resolve(Err(error()));
        }
        for worker in self.workers.values_mut() {
            if !worker.is_running() {
                continue;
            }
            worker.state = WorkerState::Draining;
            worker.coordinator.detach();
            for request in worker.coordinator.abandon(&mut self.request_ids) {
                if let AbandonedRequest::Call { request, .. } = request {
                    request.resolve(Err(error()));
                }
            }
        }
        self.spawned = 0;
        self.waiting = 0;
    }
}
