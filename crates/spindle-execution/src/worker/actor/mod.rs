mod core;
mod handler;

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::Value;
use crate::id::RequestId;
use crate::worker::module::{Method, ModuleDefinition};
use crate::worker::options::WorkerOptions;

/// Serves the requests of a pool inside a worker.
pub struct WorkerActor {
    options: WorkerOptions,
    modules: HashMap<String, Arc<ModuleDefinition>>,
    requests: HashMap<RequestId, WorkerRequest>,
    sequence: u64,
}

/// A request the worker has accepted and not replied to yet.
enum WorkerRequest {
    Loading {
        module: String,
        /// Whether the pool asked for the method arities.
        report_methods: bool,
    },
    /// The worker is receiving the call arguments.
    Binding { method: Method, args: Vec<Value> },
    Invoking { method: Method, args: Vec<Value> },
    Running { sequence: u64 },
}
