use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use spindle_server::actor::{ActorAction, ActorContext};

use crate::codec::{ErrorKind, RemoteError, Value};
use crate::id::RequestId;
use crate::protocol::{Envelope, Reply, Request};
use crate::worker::actor::{WorkerActor, WorkerRequest};
use crate::worker::event::WorkerEvent;
use crate::worker::module::{MethodOutput, MethodResult, ModuleDefinition};

fn panic_error(payload: Box<dyn Any + Send>) -> RemoteError {
    let message = if let Some(x) = payload.downcast_ref::<&str>() {
        x.to_string()
    } else if let Some(x) = payload.downcast_ref::<String>() {
        x.clone()
    } else {
        "unknown panic".to_string()
    };
    RemoteError::new(ErrorKind::Error, format!("panicked: {message}"))
}

fn result_reply(id: RequestId, result: MethodResult) -> Reply {
    match result {
        Ok(value) => Reply::Return { id, value },
        Err(e) => Reply::Throw {
            id,
            value: Value::Error(e),
        },
    }
}

impl WorkerActor {
    pub(super) fn handle_message(
        &mut self,
        ctx: &mut ActorContext<Self>,
        envelope: Envelope,
    ) -> ActorAction {
        let request = match Request::decode(envelope) {
            Ok(x) => x,
            Err(e) => return ActorAction::fail(e),
        };
        match request {
            Request::Cancel { id } => {
                self.requests.remove(&id);
                self.reply(Reply::Cancel { id })
            }
            Request::Load { id, module } => self.accept_load(ctx, id, module, true),
            Request::LateLoad { id, module } => self.accept_load(ctx, id, module, false),
            Request::Init { id, module, method } => self.handle_init(id, module, method),
            Request::Add { id, value, .. } => match self.requests.get_mut(&id) {
                Some(WorkerRequest::Binding { args, .. }) => {
                    args.push(value);
                    self.reply(Reply::Next { id })
                }
                // The request was cancelled.
                None => ActorAction::Continue,
                Some(_) => ActorAction::fail(format!("unexpected argument for request {id}")),
            },
            Request::Invoke { id } => match self.requests.remove(&id) {
                Some(WorkerRequest::Binding { method, args }) => {
                    self.requests
                        .insert(id, WorkerRequest::Invoking { method, args });
                    // The method runs on a later turn, so that a cancellation
                    // that is already in the mailbox is seen first.
                    ctx.send(WorkerEvent::RunInvoke { id });
                    ActorAction::Continue
                }
                None => ActorAction::Continue,
                Some(_) => ActorAction::fail(format!("unexpected invocation for request {id}")),
            },
        }
    }

    fn accept_load(
        &mut self,
        ctx: &mut ActorContext<Self>,
        id: RequestId,
        module: String,
        report_methods: bool,
    ) -> ActorAction {
        if self.requests.contains_key(&id) {
            return ActorAction::fail(format!("request {id} is already active"));
        }
        self.requests.insert(
            id,
            WorkerRequest::Loading {
                module,
                report_methods,
            },
        );
        ctx.send(WorkerEvent::RunLoad { id });
        ActorAction::Continue
    }

    fn handle_init(&mut self, id: RequestId, module: String, method: String) -> ActorAction {
        if self.requests.contains_key(&id) {
            return ActorAction::fail(format!("request {id} is already active"));
        }
        let Some(definition) = self.modules.get(&module) else {
            let error =
                RemoteError::new(ErrorKind::Reference, format!("module {module} is not loaded"));
            return self.reply(result_reply(id, Err(error)));
        };
        let Some(method) = definition.method(&method) else {
            let error = RemoteError::new(
                ErrorKind::Reference,
                format!("method {method} is not defined in module {module}"),
            );
            return self.reply(result_reply(id, Err(error)));
        };
        self.requests.insert(
            id,
            WorkerRequest::Binding {
                method: method.clone(),
                args: vec![],
            },
        );
        self.reply(Reply::Next { id })
    }

    fn load_module(&self, module: &str) -> Result<Arc<ModuleDefinition>, RemoteError> {
        if let Some(definition) = self.modules.get(module) {
            return Ok(Arc::clone(definition));
        }
        let loader = &self.options.loader;
        let definition = match std::panic::catch_unwind(AssertUnwindSafe(|| loader.load(module)))
        {
            Ok(x) => x?,
            Err(e) => return Err(panic_error(e)),
        };
        if definition.is_empty() {
            return Err(RemoteError::new(
                ErrorKind::Type,
                format!("module {module} must export at least one method"),
            ));
        }
        Ok(Arc::new(definition))
    }

    pub(super) fn handle_run_load(&mut self, id: RequestId) -> ActorAction {
        let Some(WorkerRequest::Loading {
            module,
            report_methods,
        }) = self.requests.remove(&id)
        else {
            // The load was cancelled.
            return ActorAction::Continue;
        };
        match self.load_module(&module) {
            Ok(definition) => {
                let methods = report_methods.then(|| definition.arities());
                self.modules.insert(module, definition);
                self.reply(Reply::Load { id, methods })
            }
            Err(e) => {
                self.options.loader.uncache(&module);
                self.reply(result_reply(id, Err(e)))
            }
        }
    }

    pub(super) fn handle_run_invoke(
        &mut self,
        ctx: &mut ActorContext<Self>,
        id: RequestId,
    ) -> ActorAction {
        let Some(WorkerRequest::Invoking { method, args }) = self.requests.remove(&id) else {
            return ActorAction::Continue;
        };
        let output = match std::panic::catch_unwind(AssertUnwindSafe(|| method.invoke(args))) {
            Ok(x) => x,
            Err(e) => return self.reply(result_reply(id, Err(panic_error(e)))),
        };
        match output {
            MethodOutput::Ready(result) => self.reply(result_reply(id, result)),
            MethodOutput::Pending(future) => {
                self.sequence += 1;
                let sequence = self.sequence;
                self.requests
                    .insert(id, WorkerRequest::Running { sequence });
                let handle = ctx.handle().clone();
                ctx.spawn(async move {
                    let result = match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(x) => x,
                        Err(e) => Err(panic_error(e)),
                    };
                    let _ = handle.send(WorkerEvent::MethodCompleted {
                        id,
                        sequence,
                        result,
                    });
                });
                ActorAction::Continue
            }
        }
    }

    pub(super) fn handle_method_completed(
        &mut self,
        id: RequestId,
        sequence: u64,
        result: MethodResult,
    ) -> ActorAction {
        match self.requests.get(&id) {
            Some(WorkerRequest::Running { sequence: x }) if *x == sequence => {
                self.requests.remove(&id);
                self.reply(result_reply(id, result))
            }
            // The call was cancelled.
            _ => ActorAction::Continue,
        }
    }
}
