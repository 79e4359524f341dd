//! The pool side of the request protocol for a single worker.
//!
//! The coordinator turns load and call requests into protocol messages,
//! batches concurrent loads of the same module into a single wire load,
//! streams call arguments on demand, and tracks cancellations until the
//! worker acknowledges them.

mod core;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::codec::RemoteError;
use crate::driver::state::CallRequest;
use crate::id::{RequestId, RequestKey, WorkerId};
use crate::worker_manager::WorkerTransport;

pub(crate) struct Coordinator {
    worker_id: WorkerId,
    transport: Box<dyn WorkerTransport>,
    /// The requests assigned to the worker, by the ID each request holds.
    pending: BTreeMap<RequestId, PendingRequest>,
    /// The IDs of the pending calls, by the caller's request key.
    calls_by_key: HashMap<RequestKey, RequestId>,
    /// The module loads in flight, by the ID used on the wire.
    batches: HashMap<RequestId, LoadBatch>,
    /// The batch that new requests for a module join.
    /// A batch being cancelled is no longer listed here.
    batch_by_module: HashMap<String, RequestId>,
    /// The batch that each delayed request waits on.
    delayed: HashMap<RequestId, RequestId>,
    /// The IDs cancelled on the wire that the worker has not acknowledged yet.
    /// Each of them still occupies a running slot.
    cancelling: HashMap<RequestId, RequestKind>,
    /// The modules loaded in the worker.
    modules: BTreeSet<String>,
    total_loads: usize,
    total_calls: usize,
}

pub(crate) enum PendingRequest {
    /// A load requested by the pool on behalf of the callers waiting on the module.
    /// It is always a dependent of a batch.
    Load { module: String },
    Call {
        request: CallRequest,
        /// The number of arguments sent to the worker.
        cursor: usize,
    },
}

impl PendingRequest {
    fn kind(&self) -> RequestKind {
        match self {
            PendingRequest::Load { .. } => RequestKind::Load,
            PendingRequest::Call { .. } => RequestKind::Call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Load,
    Call,
}

struct LoadBatch {
    module: String,
    /// The requests waiting on the load, in arrival order.
    dependents: Vec<RequestId>,
}

#[derive(Debug)]
pub(crate) enum LoadOutcome {
    Loaded {
        module: String,
        methods: Option<BTreeMap<String, usize>>,
        /// Whether any request still waited on the load when it finished.
        wanted: bool,
    },
    Failed {
        module: String,
        error: RemoteError,
        wanted: bool,
    },
}

#[derive(Debug, Default)]
pub(crate) struct ReplyOutcome {
    pub load: Option<LoadOutcome>,
    /// The number of running slots released.
    pub freed: usize,
}

/// A request left behind by a worker that is going away.
pub(crate) enum AbandonedRequest {
    Load {
        module: String,
    },
    Call {
        request: CallRequest,
        /// Whether the worker may have started the call,
        /// in which case it is unsafe to run the call again.
        sent: bool,
    },
}
