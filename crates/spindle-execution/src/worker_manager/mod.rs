mod local;
mod options;
mod process;

use async_trait::async_trait;
pub use local::LocalWorkerManager;
pub use options::WorkerLaunchOptions;
pub use process::{ProcessWorkerManager, ProcessWorkerManagerOptions};

use crate::error::{ExecutionError, ExecutionResult};
use crate::id::WorkerId;
use crate::protocol::Envelope;

#[async_trait]
pub trait WorkerManager: Send + Sync + 'static {
    /// Launches a worker and returns the transport to talk to it.
    /// The worker is ready to receive messages when this method returns.
    async fn launch_worker(
        &self,
        id: WorkerId,
        options: WorkerLaunchOptions,
    ) -> ExecutionResult<Box<dyn WorkerTransport>>;

    /// Stops a worker on a best-effort basis.
    async fn stop_worker(&self, id: WorkerId) -> ExecutionResult<()>;

    /// Stops all workers and waits for them to terminate.
    async fn stop(&self) -> ExecutionResult<()>;
}

/// The message channel to a single worker.
pub trait WorkerTransport: Send + 'static {
    /// Starts delivering messages and lifecycle events from the worker to the listener.
    /// Messages the worker sent before this call are delivered first.
    fn attach(&mut self, listener: Box<dyn WorkerListener>);

    /// Sends a message to the worker without waiting for it to be delivered.
    fn send(&self, envelope: Envelope) -> ExecutionResult<()>;

    /// Stops delivering to the listener. No listener method is called afterward.
    fn detach(&mut self);

    /// Whether transferable handles can be sent over this transport.
    fn supports_handles(&self) -> bool;
}

pub trait WorkerListener: Send + Sync + 'static {
    fn on_message(&self, envelope: Envelope);

    /// Called once when the worker terminates without being detached.
    fn on_exit(&self, error: ExecutionError);
}
