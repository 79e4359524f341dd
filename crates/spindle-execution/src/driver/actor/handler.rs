use std::sync::Arc;

use log::{info, warn};
use spindle_server::actor::{ActorAction, ActorContext};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::driver::actor::DriverActor;
use crate::driver::event::DriverEvent;
use crate::driver::state::{CallRequest, PoolSnapshot};
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::{RequestKey, WorkerId};
use crate::module::ModuleHandle;
use crate::protocol::Envelope;
use crate::worker_manager::WorkerTransport;

impl DriverActor {
    pub(super) fn handle_load(
        &mut self,
        ctx: &mut ActorContext<Self>,
        key: RequestKey,
        module: String,
        result: oneshot::Sender<ExecutionResult<ModuleHandle>>,
    ) -> ActorAction {
        self.worker_pool.load(ctx, key, module, result);
        ActorAction::Continue
    }

    pub(super) fn handle_call(
        &mut self,
        ctx: &mut ActorContext<Self>,
        request: CallRequest,
    ) -> ActorAction {
        self.worker_pool.call(ctx, request);
        ActorAction::Continue
    }

    pub(super) fn handle_cancel_load(
        &mut self,
        ctx: &mut ActorContext<Self>,
        key: RequestKey,
        module: String,
    ) -> ActorAction {
        self.worker_pool.cancel_load(ctx, key, &module);
        ActorAction::Continue
    }

    pub(super) fn handle_cancel_call(
        &mut self,
        ctx: &mut ActorContext<Self>,
        key: RequestKey,
    ) -> ActorAction {
        self.worker_pool.cancel_call(ctx, key);
        ActorAction::Continue
    }

    pub(super) fn handle_resolve_cached_load(
        &mut self,
        key: RequestKey,
        module: String,
    ) -> ActorAction {
        self.worker_pool.resolve_cached_load(key, &module);
        ActorAction::Continue
    }

    pub(super) fn handle_dispatch_load(
        &mut self,
        ctx: &mut ActorContext<Self>,
        module: String,
    ) -> ActorAction {
        self.worker_pool.dispatch_load(ctx, module);
        ActorAction::Continue
    }

    pub(super) fn handle_worker_launched(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        result: ExecutionResult<Box<dyn WorkerTransport>>,
    ) -> ActorAction {
        self.worker_pool
            .handle_worker_launched(ctx, worker_id, result);
        ActorAction::Continue
    }

    pub(super) fn handle_worker_message(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        envelope: Envelope,
    ) -> ActorAction {
        self.worker_pool
            .handle_worker_message(ctx, worker_id, envelope);
        ActorAction::Continue
    }

    pub(super) fn handle_worker_exited(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        error: ExecutionError,
    ) -> ActorAction {
        self.worker_pool.fail_worker(ctx, worker_id, error);
        ActorAction::Continue
    }

    pub(super) fn handle_worker_stopped(&mut self, worker_id: WorkerId) -> ActorAction {
        info!("worker {worker_id} has stopped");
        self.worker_pool.handle_worker_stopped(worker_id);
        ActorAction::Continue
    }

    pub(super) fn handle_probe_idle_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        instant: Instant,
    ) -> ActorAction {
        self.worker_pool.probe_idle_worker(ctx, worker_id, instant);
        ActorAction::Continue
    }

    pub(super) fn handle_snapshot(&mut self, result: oneshot::Sender<PoolSnapshot>) -> ActorAction {
        let _ = result.send(self.worker_pool.snapshot());
        ActorAction::Continue
    }

    pub(super) fn handle_shutdown(
        &mut self,
        ctx: &mut ActorContext<Self>,
        result: oneshot::Sender<ExecutionResult<()>>,
    ) -> ActorAction {
        self.shutdown.push(result);
        if self.shutdown.len() > 1 {
            return ActorAction::Continue;
        }
        info!("shutting down the worker pool");
        self.worker_pool.close();
        let worker_manager = Arc::clone(&self.worker_manager);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let result = worker_manager.stop().await;
            let _ = handle.send(DriverEvent::ShutdownComplete { result });
        });
        ActorAction::Continue
    }

    pub(super) fn handle_shutdown_complete(&mut self, result: ExecutionResult<()>) -> ActorAction {
        if let Err(e) = &result {
            warn!("failed to stop workers: {e}");
        }
        let message = result.as_ref().err().map(|e| e.to_string());
        for sender in self.shutdown.drain(..) {
            let result = match &message {
                None => Ok(()),
                Some(x) => Err(ExecutionError::internal(x.clone())),
            };
            let _ = sender.send(result);
        }
        ActorAction::Stop
    }
}
