use std::collections::HashMap;

use log::{debug, warn};
use spindle_server::actor::{Actor, ActorAction, ActorContext};

use crate::protocol::Reply;
use crate::worker::actor::WorkerActor;
use crate::worker::event::WorkerEvent;
use crate::worker::options::WorkerOptions;

impl Actor for WorkerActor {
    type Message = WorkerEvent;
    type Options = WorkerOptions;

    fn name() -> &'static str {
        "worker"
    }

    fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            modules: HashMap::new(),
            requests: HashMap::new(),
            sequence: 0,
        }
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: WorkerEvent) -> ActorAction {
        match message {
            WorkerEvent::Message { envelope } => self.handle_message(ctx, envelope),
            WorkerEvent::RunLoad { id } => self.handle_run_load(id),
            WorkerEvent::RunInvoke { id } => self.handle_run_invoke(ctx, id),
            WorkerEvent::MethodCompleted {
                id,
                sequence,
                result,
            } => self.handle_method_completed(id, sequence, result),
            WorkerEvent::Shutdown => ActorAction::Stop,
        }
    }

    fn stop(self, _ctx: &mut ActorContext<Self>) {
        debug!(
            "worker stopped with {} unfinished requests",
            self.requests.len()
        );
    }
}

impl WorkerActor {
    pub(super) fn reply(&self, reply: Reply) -> ActorAction {
        match self.options.output.send(reply.encode()) {
            Ok(()) => ActorAction::Continue,
            Err(_) => {
                warn!("the pool is no longer listening to the worker");
                ActorAction::Stop
            }
        }
    }
}
