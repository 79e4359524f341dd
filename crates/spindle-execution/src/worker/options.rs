use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::Envelope;
use crate::worker::module::ModuleLoader;

pub struct WorkerOptions {
    pub loader: Arc<dyn ModuleLoader>,
    /// Where the worker sends its replies to the pool.
    pub output: mpsc::UnboundedSender<Envelope>,
}
