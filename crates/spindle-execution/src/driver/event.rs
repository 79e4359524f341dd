use std::borrow::Cow;

use spindle_server::actor::ActorHandle;
use spindle_telemetry::common::{SpanAssociation, SpanAttribute};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::Value;
use crate::driver::actor::DriverActor;
use crate::driver::options::CallOptions;
use crate::driver::state::{CallRequest, PoolSnapshot};
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::{RequestKey, WorkerId};
use crate::module::ModuleHandle;
use crate::protocol::Envelope;
use crate::worker_manager::{WorkerListener, WorkerTransport};

pub(crate) enum DriverEvent {
    Load {
        key: RequestKey,
        module: String,
        result: oneshot::Sender<ExecutionResult<ModuleHandle>>,
    },
    /// Submits a call, either from a caller or again after a worker crash.
    Call {
        request: CallRequest,
    },
    CancelLoad {
        key: RequestKey,
        module: String,
    },
    CancelCall {
        key: RequestKey,
    },
    ResolveCachedLoad {
        key: RequestKey,
        module: String,
    },
    DispatchLoad {
        module: String,
    },
    WorkerLaunched {
        worker_id: WorkerId,
        result: ExecutionResult<Box<dyn WorkerTransport>>,
    },
    WorkerMessage {
        worker_id: WorkerId,
        envelope: Envelope,
    },
    WorkerExited {
        worker_id: WorkerId,
        error: ExecutionError,
    },
    WorkerStopped {
        worker_id: WorkerId,
    },
    ProbeIdleWorker {
        worker_id: WorkerId,
        instant: Instant,
    },
    Snapshot {
        result: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        result: oneshot::Sender<ExecutionResult<()>>,
    },
    ShutdownComplete {
        result: ExecutionResult<()>,
    },
}

impl DriverEvent {
    pub fn call(
        key: RequestKey,
        module: String,
        method: String,
        args: Vec<Value>,
        options: CallOptions,
        result: oneshot::Sender<ExecutionResult<Value>>,
    ) -> Self {
        DriverEvent::Call {
            request: CallRequest {
                key,
                module,
                method,
                args,
                keep_open: options.keep_open,
                resubmit_on_crash: options.resubmit_on_crash,
                result,
            },
        }
    }
}

impl SpanAssociation for DriverEvent {
    fn name(&self) -> Cow<'static, str> {
        let name = match self {
            DriverEvent::Load { .. } => "Load",
            DriverEvent::Call { .. } => "Call",
            DriverEvent::CancelLoad { .. } => "CancelLoad",
            DriverEvent::CancelCall { .. } => "CancelCall",
            DriverEvent::ResolveCachedLoad { .. } => "ResolveCachedLoad",
            DriverEvent::DispatchLoad { .. } => "DispatchLoad",
            DriverEvent::WorkerLaunched { .. } => "WorkerLaunched",
            DriverEvent::WorkerMessage { .. } => "WorkerMessage",
            DriverEvent::WorkerExited { .. } => "WorkerExited",
            DriverEvent::WorkerStopped { .. } => "WorkerStopped",
            DriverEvent::ProbeIdleWorker { .. } => "ProbeIdleWorker",
            DriverEvent::Snapshot { .. } => "Snapshot",
            DriverEvent::Shutdown { .. } => "Shutdown",
            DriverEvent::ShutdownComplete { .. } => "ShutdownComplete",
        };
        name.into()
    }

    fn properties(&self) -> impl IntoIterator<Item = (Cow<'static, str>, Cow<'static, str>)> {
        let mut p: Vec<(&'static str, String)> = vec![];
        match self {
            DriverEvent::Load { key, module, .. }
            | DriverEvent::CancelLoad { key, module }
            | DriverEvent::ResolveCachedLoad { key, module } => {
                p.push((SpanAttribute::POOL_REQUEST_KEY, key.to_string()));
                p.push((SpanAttribute::POOL_MODULE_NAME, module.clone()));
            }
            DriverEvent::Call { request } => {
                p.push((SpanAttribute::POOL_REQUEST_KEY, request.key.to_string()));
                p.push((SpanAttribute::POOL_MODULE_NAME, request.module.clone()));
                p.push((SpanAttribute::POOL_METHOD_NAME, request.method.clone()));
            }
            DriverEvent::CancelCall { key } => {
                p.push((SpanAttribute::POOL_REQUEST_KEY, key.to_string()));
            }
            DriverEvent::DispatchLoad { module } => {
                p.push((SpanAttribute::POOL_MODULE_NAME, module.clone()));
            }
            DriverEvent::WorkerMessage {
                worker_id,
                envelope,
            } => {
                p.push((SpanAttribute::POOL_WORKER_ID, worker_id.to_string()));
                if let Some(x) = envelope.message.first() {
                    p.push((SpanAttribute::PROTOCOL_MESSAGE_TYPE, x.to_string()));
                }
                if let Some(x) = envelope.message.get(1) {
                    p.push((SpanAttribute::PROTOCOL_REQUEST_ID, x.to_string()));
                }
            }
            DriverEvent::WorkerExited { worker_id, error } => {
                p.push((SpanAttribute::POOL_WORKER_ID, worker_id.to_string()));
                p.push((SpanAttribute::EXCEPTION_MESSAGE, error.to_string()));
            }
            DriverEvent::WorkerLaunched { worker_id, .. }
            | DriverEvent::WorkerStopped { worker_id }
            | DriverEvent::ProbeIdleWorker { worker_id, .. } => {
                p.push((SpanAttribute::POOL_WORKER_ID, worker_id.to_string()));
            }
            DriverEvent::Snapshot { .. }
            | DriverEvent::Shutdown { .. }
            | DriverEvent::ShutdownComplete { .. } => {}
        }
        p.into_iter().map(|(k, v)| (k.into(), v.into()))
    }
}

/// Forwards the messages and the exit of a worker to the driver.
pub(crate) struct DriverWorkerListener {
    worker_id: WorkerId,
    handle: ActorHandle<DriverActor>,
}

impl DriverWorkerListener {
    pub fn new(worker_id: WorkerId, handle: ActorHandle<DriverActor>) -> Self {
        Self { worker_id, handle }
    }
}

impl WorkerListener for DriverWorkerListener {
    fn on_message(&self, envelope: Envelope) {
        let _ = self.handle.send(DriverEvent::WorkerMessage {
            worker_id: self.worker_id,
            envelope,
        });
    }

    fn on_exit(&self, error: ExecutionError) {
        let _ = self.handle.send(DriverEvent::WorkerExited {
            worker_id: self.worker_id,
            error,
        });
    }
}
