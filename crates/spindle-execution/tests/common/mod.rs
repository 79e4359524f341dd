#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spindle_execution::error::{ExecutionError, ExecutionResult};
use spindle_execution::id::WorkerId;
use spindle_execution::protocol::{Envelope, Reply, Request};
use spindle_execution::worker_manager::{
    WorkerLaunchOptions, WorkerListener, WorkerManager, WorkerTransport,
};
use tokio::sync::mpsc;

type ListenerSlot = Arc<Mutex<Option<Box<dyn WorkerListener>>>>;

#[derive(Default)]
struct ScriptState {
    listeners: HashMap<WorkerId, ListenerSlot>,
    launched: Vec<WorkerId>,
    stopped: Vec<WorkerId>,
    failing_launches: usize,
    without_handles: bool,
}

/// A worker manager whose workers are played by the test.
///
/// Every request sent to a worker shows up in [`ScriptedWorkers`],
/// and the test answers on behalf of the worker.
pub struct ScriptedWorkerManager {
    requests: mpsc::UnboundedSender<(WorkerId, Request)>,
    state: Mutex<ScriptState>,
}

pub struct ScriptedWorkers {
    requests: mpsc::UnboundedReceiver<(WorkerId, Request)>,
}

impl ScriptedWorkerManager {
    pub fn new() -> (Arc<Self>, ScriptedWorkers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            requests: tx,
            state: Mutex::new(ScriptState::default()),
        });
        (manager, ScriptedWorkers { requests: rx })
    }

    pub fn fail_launches(&self, count: usize) {
        self.state.lock().unwrap().failing_launches = count;
    }

    /// Makes every worker launched afterward refuse transferable handles.
    pub fn without_handles(&self) {
        self.state.lock().unwrap().without_handles = true;
    }

    pub fn launched(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn stopped(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().stopped.clone()
    }

    fn listener(&self, worker_id: WorkerId) -> ListenerSlot {
        let state = self.state.lock().unwrap();
        Arc::clone(state.listeners.get(&worker_id).unwrap())
    }

    pub fn reply(&self, worker_id: WorkerId, reply: Reply) {
        let slot = self.listener(worker_id);
        let listener = slot.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_message(reply.encode());
        }
    }

    pub fn send_raw(&self, worker_id: WorkerId, envelope: Envelope) {
        let slot = self.listener(worker_id);
        let listener = slot.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_message(envelope);
        }
    }

    pub fn crash(&self, worker_id: WorkerId) {
        let slot = self.listener(worker_id);
        let listener = slot.lock().unwrap().take();
        if let Some(listener) = listener {
            listener.on_exit(ExecutionError::WorkerExited(format!(
                "worker {worker_id} crashed"
            )));
        }
    }
}

#[async_trait]
impl WorkerManager for ScriptedWorkerManager {
    async fn launch_worker(
        &self,
        id: WorkerId,
        _options: WorkerLaunchOptions,
    ) -> ExecutionResult<Box<dyn WorkerTransport>> {
        let mut state = self.state.lock().unwrap();
        if state.failing_launches > 0 {
            state.failing_launches -= 1;
            return Err(ExecutionError::WorkerLaunchError(format!(
                "worker {id} refused to start"
            )));
        }
        let slot: ListenerSlot = Arc::new(Mutex::new(None));
        state.listeners.insert(id, Arc::clone(&slot));
        state.launched.push(id);
        Ok(Box::new(ScriptedTransport {
            worker_id: id,
            requests: self.requests.clone(),
            listener: slot,
            supports_handles: !state.without_handles,
        }))
    }

    async fn stop_worker(&self, id: WorkerId) -> ExecutionResult<()> {
        self.state.lock().unwrap().stopped.push(id);
        Ok(())
    }

    async fn stop(&self) -> ExecutionResult<()> {
        Ok(())
    }
}

struct ScriptedTransport {
    worker_id: WorkerId,
    requests: mpsc::UnboundedSender<(WorkerId, Request)>,
    listener: ListenerSlot,
    supports_handles: bool,
}

impl WorkerTransport for ScriptedTransport {
    fn attach(&mut self, listener: Box<dyn WorkerListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn send(&self, envelope: Envelope) -> ExecutionResult<()> {
        let request = Request::decode(envelope)?;
        self.requests
            .send((self.worker_id, request))
            .map_err(|_| ExecutionError::internal("the test is over"))
    }

    fn detach(&mut self) {
        *self.listener.lock().unwrap() = None;
    }

    fn supports_handles(&self) -> bool {
        self.supports_handles
    }
}

impl ScriptedWorkers {
    pub async fn next(&mut self) -> (WorkerId, Request) {
        tokio::time::timeout(Duration::from_secs(60), self.requests.recv())
            .await
            .expect("timed out waiting for a worker request")
            .expect("the pool dropped the worker manager")
    }

    /// Asserts that no request has been sent to any worker.
    pub async fn assert_quiet(&mut self) {
        settle().await;
        if let Ok(x) = self.requests.try_recv() {
            panic!("unexpected worker request: {x:?}");
        }
    }
}

/// Lets the pool process every event that is ready.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
