use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spindle_server::actor::{ActorHandle, ActorSystem};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::Value;
use crate::driver::actor::{DriverActor, DriverOptions};
use crate::driver::event::DriverEvent;
use crate::driver::options::{CallOptions, LoadOptions, PoolOptions};
use crate::driver::state::{PoolSnapshot, WorkerStats};
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::RequestKey;
use crate::module::ModuleHandle;
use crate::worker_manager::WorkerManager;

/// The state shared by all clones of a pool client.
pub(crate) struct PoolShared {
    pub options: PoolOptions,
    next_key: AtomicU64,
}

impl PoolShared {
    fn next_key(&self) -> RequestKey {
        RequestKey::from(self.next_key.fetch_add(1, Ordering::Relaxed))
    }
}

/// A pool of workers that load modules and run their methods.
///
/// The pool is a cheap handle to a driver task that owns all the state,
/// so it can be cloned and shared freely. Every request is answered
/// asynchronously, even when the answer is already known.
#[derive(Clone)]
pub struct Pool {
    driver: ActorHandle<DriverActor>,
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Creates a pool and starts launching its minimum number of workers.
    /// This must be called within a Tokio runtime.
    pub fn new(options: PoolOptions, worker_manager: Arc<dyn WorkerManager>) -> Self {
        let shared = Self::shared(options);
        let driver = ActorHandle::new(DriverOptions {
            shared: Arc::clone(&shared),
            worker_manager,
        });
        Self { driver, shared }
    }

    /// Creates a pool whose driver belongs to the actor system.
    pub fn with_system(
        system: &mut ActorSystem,
        options: PoolOptions,
        worker_manager: Arc<dyn WorkerManager>,
    ) -> Self {
        let shared = Self::shared(options);
        let driver = system.spawn(DriverOptions {
            shared: Arc::clone(&shared),
            worker_manager,
        });
        Self { driver, shared }
    }

    fn shared(options: PoolOptions) -> Arc<PoolShared> {
        Arc::new(PoolShared {
            options,
            next_key: AtomicU64::new(1),
        })
    }

    pub(crate) fn from_parts(driver: ActorHandle<DriverActor>, shared: Arc<PoolShared>) -> Self {
        Self { driver, shared }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    /// Loads a module on a worker and returns the cached handle for it.
    /// Concurrent loads of the same module share a single load on one worker.
    pub async fn load(&self, module: &str, options: LoadOptions) -> ExecutionResult<ModuleHandle> {
        if is_cancelled(options.cancel.as_ref()) {
            return Err(ExecutionError::Cancelled);
        }
        let key = self.shared.next_key();
        let (tx, rx) = oneshot::channel();
        self.driver.send(DriverEvent::Load {
            key,
            module: module.to_string(),
            result: tx,
        })?;
        self.wait(rx, options.cancel.as_ref(), || DriverEvent::CancelLoad {
            key,
            module: module.to_string(),
        })
        .await
    }

    pub(crate) async fn call(
        &self,
        module: &str,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> ExecutionResult<Value> {
        if is_cancelled(options.cancel.as_ref()) {
            return Err(ExecutionError::Cancelled);
        }
        let key = self.shared.next_key();
        let cancel = options.cancel.clone();
        let (tx, rx) = oneshot::channel();
        self.driver.send(DriverEvent::call(
            key,
            module.to_string(),
            method.to_string(),
            args,
            options,
            tx,
        ))?;
        self.wait(rx, cancel.as_ref(), || DriverEvent::CancelCall { key })
            .await
    }

    async fn wait<T>(
        &self,
        rx: oneshot::Receiver<ExecutionResult<T>>,
        cancel: Option<&CancellationToken>,
        on_cancel: impl FnOnce() -> DriverEvent,
    ) -> ExecutionResult<T> {
        let Some(token) = cancel else {
            return receive(rx).await;
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                // The driver rejects the request with the same error if it is still pending.
                let _ = self.driver.send(on_cancel());
                Err(ExecutionError::Cancelled)
            }
            result = receive(rx) => result,
        }
    }

    pub async fn snapshot(&self) -> ExecutionResult<PoolSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.driver.send(DriverEvent::Snapshot { result: tx })?;
        rx.await
            .map_err(|_| ExecutionError::internal("the worker pool has stopped"))
    }

    /// The number of workers that are ready.
    pub async fn total(&self) -> ExecutionResult<usize> {
        Ok(self.snapshot().await?.total)
    }

    /// The number of workers that are ready or being launched.
    pub async fn spawned(&self) -> ExecutionResult<usize> {
        Ok(self.snapshot().await?.spawned)
    }

    pub async fn queued(&self) -> ExecutionResult<usize> {
        Ok(self.snapshot().await?.queued)
    }

    pub async fn running(&self) -> ExecutionResult<usize> {
        Ok(self.snapshot().await?.running)
    }

    /// The number of requests that have not completed, queued or running.
    pub async fn waiting(&self) -> ExecutionResult<usize> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.queued + snapshot.running)
    }

    pub async fn worker_stats(&self) -> ExecutionResult<Vec<WorkerStats>> {
        Ok(self.snapshot().await?.workers)
    }

    /// The method arities of every cached module.
    pub async fn loaded(&self) -> ExecutionResult<BTreeMap<String, BTreeMap<String, usize>>> {
        Ok(self.snapshot().await?.modules)
    }

    /// The method names of a cached module.
    pub async fn cached(&self, module: &str) -> ExecutionResult<Option<Vec<String>>> {
        Ok(self
            .snapshot()
            .await?
            .modules
            .remove(module)
            .map(|x| x.into_keys().collect()))
    }

    pub async fn loading(&self) -> ExecutionResult<Vec<String>> {
        Ok(self.snapshot().await?.loading)
    }

    /// Rejects all pending requests, stops all workers, and stops the pool.
    pub async fn close(&self) -> ExecutionResult<()> {
        let (tx, rx) = oneshot::channel();
        self.driver.send(DriverEvent::Shutdown { result: tx })?;
        rx.await
            .map_err(|_| ExecutionError::internal("the worker pool has stopped"))?
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_stopped()
    }
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(|x| x.is_cancelled())
}

async fn receive<T>(rx: oneshot::Receiver<ExecutionResult<T>>) -> ExecutionResult<T> {
    rx.await
        .map_err(|_| ExecutionError::internal("the worker pool dropped the request"))?
}
