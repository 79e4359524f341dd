use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use spindle_server::actor::{ActorHandle, ActorSystem};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{ExecutionError, ExecutionResult};
use crate::id::WorkerId;
use crate::protocol::Envelope;
use crate::worker::{ModuleLoader, WorkerActor, WorkerEvent, WorkerOptions};
use crate::worker_manager::{WorkerLaunchOptions, WorkerListener, WorkerManager, WorkerTransport};

struct LocalWorkerManagerState {
    system: ActorSystem,
    workers: HashMap<WorkerId, ActorHandle<WorkerActor>>,
}

impl LocalWorkerManagerState {
    fn new() -> Self {
        Self {
            system: ActorSystem::new(),
            workers: HashMap::new(),
        }
    }
}

/// Runs each worker as an actor in the current process.
///
/// The launch options are ignored since the workers share the process
/// working directory and environment.
pub struct LocalWorkerManager {
    loader: Arc<dyn ModuleLoader>,
    state: Mutex<LocalWorkerManagerState>,
}

impl LocalWorkerManager {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(LocalWorkerManagerState::new()),
        }
    }
}

#[async_trait]
impl WorkerManager for LocalWorkerManager {
    async fn launch_worker(
        &self,
        id: WorkerId,
        _options: WorkerLaunchOptions,
    ) -> ExecutionResult<Box<dyn WorkerTransport>> {
        let mut state = self.state.lock().await;
        if state.workers.contains_key(&id) {
            return Err(ExecutionError::WorkerLaunchError(format!(
                "worker {id} already exists"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let options = WorkerOptions {
            loader: Arc::clone(&self.loader),
            output: tx,
        };
        let handle = state.system.spawn::<WorkerActor>(options);
        state.workers.insert(id, handle.clone());
        debug!("local worker {id} started");
        Ok(Box::new(LocalWorkerTransport {
            worker_id: id,
            handle,
            replies: Some(rx),
            forwarder: None,
        }))
    }

    async fn stop_worker(&self, id: WorkerId) -> ExecutionResult<()> {
        let handle = self.state.lock().await.workers.remove(&id);
        if let Some(handle) = handle {
            let _ = handle.send(WorkerEvent::Shutdown);
            handle.wait_for_stop().await;
        }
        Ok(())
    }

    async fn stop(&self) -> ExecutionResult<()> {
        let mut state = self.state.lock().await;
        for (_, handle) in state.workers.drain() {
            let _ = handle.send(WorkerEvent::Shutdown);
        }
        state.system.join().await;
        Ok(())
    }
}

struct LocalWorkerTransport {
    worker_id: WorkerId,
    handle: ActorHandle<WorkerActor>,
    replies: Option<mpsc::UnboundedReceiver<Envelope>>,
    forwarder: Option<JoinHandle<()>>,
}

impl WorkerTransport for LocalWorkerTransport {
    fn attach(&mut self, listener: Box<dyn WorkerListener>) {
        let Some(mut replies) = self.replies.take() else {
            return;
        };
        let worker_id = self.worker_id;
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(envelope) = replies.recv().await {
                listener.on_message(envelope);
            }
            listener.on_exit(ExecutionError::WorkerExited(format!(
                "worker {worker_id} stopped"
            )));
        }));
    }

    fn send(&self, envelope: Envelope) -> ExecutionResult<()> {
        self.handle
            .send(WorkerEvent::Message { envelope })
            .map_err(|_| ExecutionError::WorkerExited(format!("worker {} stopped", self.worker_id)))
    }

    fn detach(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.replies = None;
    }

    fn supports_handles(&self) -> bool {
        true
    }
}

impl Drop for LocalWorkerTransport {
    fn drop(&mut self) {
        self.detach();
    }
}
