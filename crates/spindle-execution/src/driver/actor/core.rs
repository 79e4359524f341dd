use std::sync::Arc;

use log::info;
use spindle_server::actor::{Actor, ActorAction, ActorContext};

use crate::driver::actor::{DriverActor, DriverOptions};
use crate::driver::event::DriverEvent;
use crate::driver::worker_pool::WorkerPool;

impl Actor for DriverActor {
    type Message = DriverEvent;
    type Options = DriverOptions;

    fn name() -> &'static str {
        "driver"
    }

    fn new(options: DriverOptions) -> Self {
        Self {
            worker_manager: Arc::clone(&options.worker_manager),
            worker_pool: WorkerPool::new(options.shared, options.worker_manager),
            shutdown: vec![],
        }
    }

    fn start(&mut self, ctx: &mut ActorContext<Self>) {
        self.worker_pool.start(ctx);
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: DriverEvent) -> ActorAction {
        match message {
            DriverEvent::Load {
                key,
                module,
                result,
            } => self.handle_load(ctx, key, module, result),
            DriverEvent::Call { request } => self.handle_call(ctx, request),
            DriverEvent::CancelLoad { key, module } => self.handle_cancel_load(ctx, key, module),
            DriverEvent::CancelCall { key } => self.handle_cancel_call(ctx, key),
            DriverEvent::ResolveCachedLoad { key, module } => {
                self.handle_resolve_cached_load(key, module)
            }
            DriverEvent::DispatchLoad { module } => self.handle_dispatch_load(ctx, module),
            DriverEvent::WorkerLaunched { worker_id, result } => {
                self.handle_worker_launched(ctx, worker_id, result)
            }
            DriverEvent::WorkerMessage {
                worker_id,
                envelope,
            } => self.handle_worker_message(ctx, worker_id, envelope),
            DriverEvent::WorkerExited { worker_id, error } => {
                self.handle_worker_exited(ctx, worker_id, error)
            }
            DriverEvent::WorkerStopped { worker_id } => self.handle_worker_stopped(worker_id),
            DriverEvent::ProbeIdleWorker { worker_id, instant } => {
                self.handle_probe_idle_worker(ctx, worker_id, instant)
            }
            DriverEvent::Snapshot { result } => self.handle_snapshot(result),
            DriverEvent::Shutdown { result } => self.handle_shutdown(ctx, result),
            DriverEvent::ShutdownComplete { result } => self.handle_shutdown_complete(result),
        }
    }

    fn stop(mut self, _ctx: &mut ActorContext<Self>) {
        self.worker_pool.close();
        info!("driver has stopped");
    }
}
