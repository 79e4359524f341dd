use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::codec::{RemoteError, Value};
use crate::driver::coordinator::{
    AbandonedRequest, Coordinator, LoadBatch, LoadOutcome, PendingRequest, ReplyOutcome,
    RequestKind,
};
use crate::driver::state::{CallRequest, WorkerStats};
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::{IdAllocator, RequestId, RequestKey, WorkerId};
use crate::protocol::{Reply, Request};
use crate::worker_manager::{WorkerListener, WorkerTransport};

enum NextStep {
    Add { value: Value, keep_open: bool },
    Invoke,
}

impl Coordinator {
    pub fn new(worker_id: WorkerId, transport: Box<dyn WorkerTransport>) -> Self {
        Self {
            worker_id,
            transport,
            pending: Default::default(),
            calls_by_key: Default::default(),
            batches: Default::default(),
            batch_by_module: Default::default(),
            delayed: Default::default(),
            cancelling: Default::default(),
            modules: Default::default(),
            total_loads: 0,
            total_calls: 0,
        }
    }

    pub fn attach(&mut self, listener: Box<dyn WorkerListener>) {
        self.transport.attach(listener);
    }

    pub fn detach(&mut self) {
        self.transport.detach();
    }

    /// The number of running slots in use, including cancellations
    /// not yet acknowledged by the worker.
    pub fn running(&self) -> usize {
        self.pending.len() + self.cancelling.len()
    }

    /// Whether the worker can receive every argument of the call.
    /// Transferable handles need a transport that can carry them.
    pub fn accepts(&self, request: &CallRequest) -> bool {
        self.transport.supports_handles()
            || !request.args.iter().any(|x| matches!(x, Value::Handle(_)))
    }

    /// The request ID of a pending call.
    pub fn find_call(&self, key: RequestKey) -> Option<RequestId> {
        self.calls_by_key.get(&key).copied()
    }

    pub fn stats(&self, draining: bool) -> WorkerStats {
        let mut loads = 0;
        let mut calls = 0;
        let kinds = self
            .pending
            .values()
            .map(PendingRequest::kind)
            .chain(self.cancelling.values().copied());
        for kind in kinds {
            match kind {
                RequestKind::Load => loads += 1,
                RequestKind::Call => calls += 1,
            }
        }
        WorkerStats {
            worker_id: self.worker_id,
            running: self.running(),
            modules: self.modules.iter().cloned().collect(),
            draining,
            loads,
            calls,
            total_loads: self.total_loads,
            total_calls: self.total_calls,
        }
    }

    fn send(&self, request: Request) -> ExecutionResult<()> {
        debug!(
            "sending {} for request {} to worker {}",
            request.message_type(),
            request.id(),
            self.worker_id
        );
        self.transport.send(request.encode())
    }

    /// Assigns a module load to the worker.
    /// `cached` tells whether the pool already knows the method table of the module.
    pub fn load(
        &mut self,
        ids: &mut IdAllocator,
        module: &str,
        cached: bool,
    ) -> ExecutionResult<RequestId> {
        let id = ids.acquire()?;
        self.pending.insert(
            id,
            PendingRequest::Load {
                module: module.to_string(),
            },
        );
        self.total_loads += 1;
        self.delay(ids, id, module, cached)?;
        Ok(id)
    }

    /// Assigns a call to the worker, loading the module first if the worker
    /// does not have it yet.
    pub fn call(
        &mut self,
        ids: &mut IdAllocator,
        request: CallRequest,
        cached: bool,
    ) -> ExecutionResult<RequestId> {
        let id = ids.acquire()?;
        let module = request.module.clone();
        let method = request.method.clone();
        self.calls_by_key.insert(request.key, id);
        self.pending
            .insert(id, PendingRequest::Call { request, cursor: 0 });
        self.total_calls += 1;
        if self.modules.contains(&module) {
            self.send(Request::Init { id, module, method })?;
        } else {
            self.delay(ids, id, &module, cached)?;
        }
        Ok(id)
    }

    /// Makes the request wait on the load of the module,
    /// starting a new load if none is in flight.
    fn delay(
        &mut self,
        ids: &mut IdAllocator,
        id: RequestId,
        module: &str,
        cached: bool,
    ) -> ExecutionResult<()> {
        let (batch_id, created) = match self.batch_by_module.get(module) {
            Some(batch_id) => (*batch_id, false),
            None => {
                let batch_id = ids.acquire()?;
                self.batches.insert(
                    batch_id,
                    LoadBatch {
                        module: module.to_string(),
                        dependents: vec![],
                    },
                );
                self.batch_by_module.insert(module.to_string(), batch_id);
                (batch_id, true)
            }
        };
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.dependents.push(id);
        }
        self.delayed.insert(id, batch_id);
        if created {
            let module = module.to_string();
            let request = if cached {
                Request::LateLoad {
                    id: batch_id,
                    module,
                }
            } else {
                Request::Load {
                    id: batch_id,
                    module,
                }
            };
            self.send(request)?;
        }
        Ok(())
    }

    /// Cancels a pending request, and returns the number of running slots
    /// released right away. A cancelled call is rejected.
    /// Cancelling a request that is no longer pending is a no-op.
    pub fn cancel(&mut self, ids: &mut IdAllocator, id: RequestId) -> ExecutionResult<usize> {
        let Some(request) = self.pending.remove(&id) else {
            return Ok(0);
        };
        let kind = request.kind();
        if let PendingRequest::Call { request, .. } = request {
            self.calls_by_key.remove(&request.key);
            request.resolve(Err(ExecutionError::Cancelled));
        }
        let Some(batch_id) = self.delayed.remove(&id) else {
            self.cancelling.insert(id, kind);
            self.send(Request::Cancel { id })?;
            return Ok(0);
        };
        ids.release(id);
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return Err(ExecutionError::internal(format!(
                "load batch {batch_id} not found"
            )));
        };
        batch.dependents.retain(|x| *x != id);
        if !batch.dependents.is_empty() {
            return Ok(1);
        }
        let module = batch.module.clone();
        if self.batch_by_module.get(&module) == Some(&batch_id) {
            self.batch_by_module.remove(&module);
        }
        // The last dependent hands its running slot over to the load
        // until the worker acknowledges the cancellation.
        self.cancelling.insert(batch_id, kind);
        self.send(Request::Cancel { id: batch_id })?;
        Ok(0)
    }

    pub fn handle_reply(
        &mut self,
        ids: &mut IdAllocator,
        reply: Reply,
    ) -> ExecutionResult<ReplyOutcome> {
        match reply {
            Reply::Cancel { id } => self.handle_cancelled(ids, id),
            Reply::Load { id, methods } => self.handle_loaded(ids, id, methods),
            Reply::Next { id } => self.handle_next(id),
            Reply::Return { id, value } => self.complete(ids, id, Ok(value)),
            Reply::Throw { id, value } => {
                let error = RemoteError::from(value);
                if self.batches.contains_key(&id) {
                    self.fail_load(ids, id, error)
                } else {
                    self.complete(ids, id, Err(ExecutionError::Remote(error)))
                }
            }
        }
    }

    fn remove_batch(&mut self, id: RequestId) -> Option<LoadBatch> {
        let batch = self.batches.remove(&id)?;
        if self.batch_by_module.get(&batch.module) == Some(&id) {
            self.batch_by_module.remove(&batch.module);
        }
        Some(batch)
    }

    fn handle_cancelled(
        &mut self,
        ids: &mut IdAllocator,
        id: RequestId,
    ) -> ExecutionResult<ReplyOutcome> {
        if self.cancelling.remove(&id).is_none() {
            return Err(ExecutionError::protocol(format!(
                "unexpected cancellation for request {id}"
            )));
        }
        self.remove_batch(id);
        ids.release(id);
        Ok(ReplyOutcome {
            load: None,
            freed: 1,
        })
    }

    fn handle_loaded(
        &mut self,
        ids: &mut IdAllocator,
        id: RequestId,
        methods: Option<BTreeMap<String, usize>>,
    ) -> ExecutionResult<ReplyOutcome> {
        let Some(batch) = self.remove_batch(id) else {
            return Err(ExecutionError::protocol(format!(
                "unexpected load result for request {id}"
            )));
        };
        self.modules.insert(batch.module.clone());
        // A load being cancelled keeps its ID until the acknowledgment.
        let wanted = !self.cancelling.contains_key(&id);
        if wanted {
            ids.release(id);
        }
        let mut freed = 0;
        let mut inits = vec![];
        for dependent in batch.dependents {
            self.delayed.remove(&dependent);
            match self.pending.get(&dependent) {
                Some(PendingRequest::Load { .. }) => {
                    self.pending.remove(&dependent);
                    ids.release(dependent);
                    freed += 1;
                }
                Some(PendingRequest::Call { request, .. }) => {
                    inits.push(Request::Init {
                        id: dependent,
                        module: request.module.clone(),
                        method: request.method.clone(),
                    });
                }
                None => {}
            }
        }
        for init in inits {
            self.send(init)?;
        }
        Ok(ReplyOutcome {
            load: Some(LoadOutcome::Loaded {
                module: batch.module,
                methods,
                wanted,
            }),
            freed,
        })
    }

    fn fail_load(
        &mut self,
        ids: &mut IdAllocator,
        id: RequestId,
        error: RemoteError,
    ) -> ExecutionResult<ReplyOutcome> {
        let Some(batch) = self.remove_batch(id) else {
            return Err(ExecutionError::internal(format!(
                "load batch {id} not found"
            )));
        };
        let wanted = !self.cancelling.contains_key(&id);
        if wanted {
            ids.release(id);
        }
        let mut freed = 0;
        for dependent in batch.dependents {
            self.delayed.remove(&dependent);
            match self.pending.remove(&dependent) {
                Some(PendingRequest::Load { .. }) => {}
                Some(PendingRequest::Call { request, .. }) => {
                    self.calls_by_key.remove(&request.key);
                    request.resolve(Err(ExecutionError::Remote(error.clone())));
                }
                None => continue,
            }
            ids.release(dependent);
            freed += 1;
        }
        Ok(ReplyOutcome {
            load: Some(LoadOutcome::Failed {
                module: batch.module,
                error,
                wanted,
            }),
            freed,
        })
    }

    fn handle_next(&mut self, id: RequestId) -> ExecutionResult<ReplyOutcome> {
        let step = match self.pending.get_mut(&id) {
            Some(PendingRequest::Call { request, cursor }) if !self.delayed.contains_key(&id) => {
                match request.args.get(*cursor) {
                    Some(value) => {
                        let value = value.clone();
                        let keep_open = request.keep_open.applies(*cursor, &value);
                        *cursor += 1;
                        NextStep::Add { value, keep_open }
                    }
                    None => NextStep::Invoke,
                }
            }
            // The call may have been cancelled while the request was in flight.
            None if self.cancelling.contains_key(&id) => return Ok(ReplyOutcome::default()),
            _ => {
                return Err(ExecutionError::protocol(format!(
                    "unexpected argument request for request {id}"
                )))
            }
        };
        match step {
            NextStep::Add { value, keep_open } => {
                self.send(Request::Add {
                    id,
                    value,
                    keep_open,
                })?;
            }
            NextStep::Invoke => self.send(Request::Invoke { id })?,
        }
        Ok(ReplyOutcome::default())
    }

    fn complete(
        &mut self,
        ids: &mut IdAllocator,
        id: RequestId,
        result: ExecutionResult<Value>,
    ) -> ExecutionResult<ReplyOutcome> {
        match self.pending.get(&id) {
            Some(PendingRequest::Call { .. }) if !self.delayed.contains_key(&id) => {}
            // The call finished before the worker saw the cancellation.
            None if self.cancelling.contains_key(&id) => return Ok(ReplyOutcome::default()),
            _ => {
                return Err(ExecutionError::protocol(format!(
                    "unexpected result for request {id}"
                )))
            }
        }
        if let Some(PendingRequest::Call { request, .. }) = self.pending.remove(&id) {
            self.calls_by_key.remove(&request.key);
            request.resolve(result);
        }
        ids.release(id);
        Ok(ReplyOutcome {
            load: None,
            freed: 1,
        })
    }

    /// Releases every ID held for the worker and returns the pending requests,
    /// leaving the coordinator empty.
    pub fn abandon(&mut self, ids: &mut IdAllocator) -> Vec<AbandonedRequest> {
        let pending = std::mem::take(&mut self.pending);
        let delayed = std::mem::take(&mut self.delayed);
        let batches = std::mem::take(&mut self.batches);
        let cancelling = std::mem::take(&mut self.cancelling);
        self.batch_by_module.clear();
        self.calls_by_key.clear();
        let held = pending
            .keys()
            .chain(batches.keys())
            .chain(cancelling.keys())
            .copied()
            .collect::<BTreeSet<_>>();
        for id in held {
            ids.release(id);
        }
        pending
            .into_iter()
            .map(|(id, request)| match request {
                PendingRequest::Load { module } => AbandonedRequest::Load { module },
                PendingRequest::Call { request, cursor } => {
                    let sent = !delayed.contains_key(&id) && cursor >= request.args.len();
                    AbandonedRequest::Call { request, sent }
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value as JsonValue};
    use tokio::sync::oneshot;

    use super::*;
    use crate::codec::{ErrorKind, TransferHandle};
    use crate::driver::options::KeepOpen;
    use crate::protocol::Envelope;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Request>>>,
        supports_handles: bool,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<JsonValue> {
            let mut sent = self.sent.lock().unwrap();
            sent.drain(..)
                .map(|x| JsonValue::Array(x.encode().message))
                .collect()
        }
    }

    impl WorkerTransport for RecordingTransport {
        fn attach(&mut self, _listener: Box<dyn WorkerListener>) {}

        fn send(&self, envelope: Envelope) -> ExecutionResult<()> {
            self.sent.lock().unwrap().push(Request::decode(envelope)?);
            Ok(())
        }

        fn detach(&mut self) {}

        fn supports_handles(&self) -> bool {
            self.supports_handles
        }
    }

    fn setup() -> (Coordinator, RecordingTransport, IdAllocator) {
        let transport = RecordingTransport::default();
        let coordinator = Coordinator::new(WorkerId::from(1), Box::new(transport.clone()));
        (coordinator, transport, IdAllocator::new())
    }

    fn call(
        key: u64,
        method: &str,
        args: Vec<Value>,
    ) -> (CallRequest, oneshot::Receiver<ExecutionResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        let request = CallRequest {
            key: RequestKey::from(key),
            module: "math".to_string(),
            method: method.to_string(),
            args,
            keep_open: KeepOpen::None,
            resubmit_on_crash: false,
            result: tx,
        };
        (request, rx)
    }

    fn reply(
        coordinator: &mut Coordinator,
        ids: &mut IdAllocator,
        reply: Reply,
    ) -> ReplyOutcome {
        coordinator.handle_reply(ids, reply).unwrap()
    }

    fn id(value: u32) -> RequestId {
        RequestId::from(value)
    }

    #[test]
    fn test_loads_share_one_wire_load() {
        let (mut coordinator, transport, mut ids) = setup();
        let load = coordinator.load(&mut ids, "math", false).unwrap();
        let (request, mut rx) = call(1, "add", vec![json!(1).into(), json!(2).into()]);
        let call_id = coordinator.call(&mut ids, request, false).unwrap();
        assert_eq!(transport.take(), vec![json!([1, 2, "math"])]);
        assert_eq!(coordinator.running(), 2);

        let methods = BTreeMap::from([("add".to_string(), 2)]);
        let outcome = reply(
            &mut coordinator,
            &mut ids,
            Reply::Load {
                id: id(2),
                methods: Some(methods.clone()),
            },
        );
        assert_eq!(outcome.freed, 1);
        assert!(matches!(
            outcome.load,
            Some(LoadOutcome::Loaded { wanted: true, methods: Some(ref m), .. }) if *m == methods
        ));
        assert!(!ids.is_active(load));
        assert_eq!(transport.take(), vec![json!([3, 3, "math", "add"])]);

        reply(&mut coordinator, &mut ids, Reply::Next { id: call_id });
        reply(&mut coordinator, &mut ids, Reply::Next { id: call_id });
        reply(&mut coordinator, &mut ids, Reply::Next { id: call_id });
        assert_eq!(
            transport.take(),
            vec![json!([4, 3, 1, 1]), json!([4, 3, 1, 2]), json!([5, 3])]
        );
        let outcome = reply(
            &mut coordinator,
            &mut ids,
            Reply::Return {
                id: call_id,
                value: json!(3).into(),
            },
        );
        assert_eq!(outcome.freed, 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::Data(json!(3)));
        assert_eq!(coordinator.running(), 0);
        assert_eq!(ids.active(), 0);
    }

    #[test]
    fn test_call_on_loaded_module_sends_init() {
        let (mut coordinator, transport, mut ids) = setup();
        coordinator.load(&mut ids, "math", true).unwrap();
        assert_eq!(transport.take(), vec![json!([2, 2, "math"])]);
        reply(
            &mut coordinator,
            &mut ids,
            Reply::Load {
                id: id(2),
                methods: None,
            },
        );
        let (request, _rx) = call(1, "neg", vec![]);
        let call_id = coordinator.call(&mut ids, request, true).unwrap();
        assert_eq!(call_id, id(1));
        reply(&mut coordinator, &mut ids, Reply::Next { id: call_id });
        assert_eq!(
            transport.take(),
            vec![json!([3, 1, "math", "neg"]), json!([5, 1])]
        );
        assert_eq!(coordinator.stats(false).modules, vec!["math".to_string()]);
    }

    #[test]
    fn test_cancel_last_dependent_cancels_load() {
        let (mut coordinator, transport, mut ids) = setup();
        let load = coordinator.load(&mut ids, "math", false).unwrap();
        transport.take();
        assert_eq!(coordinator.cancel(&mut ids, load).unwrap(), 0);
        assert_eq!(transport.take(), vec![json!([0, 2])]);
        assert_eq!(coordinator.running(), 1);
        // a new load does not join the batch being cancelled
        coordinator.load(&mut ids, "math", false).unwrap();
        assert_eq!(transport.take(), vec![json!([1, 3, "math"])]);

        let outcome = reply(
            &mut coordinator,
            &mut ids,
            Reply::Load {
                id: id(2),
                methods: Some(BTreeMap::new()),
            },
        );
        assert!(matches!(
            outcome.load,
            Some(LoadOutcome::Loaded { wanted: false, .. })
        ));
        assert!(ids.is_active(id(2)));
        let outcome = reply(&mut coordinator, &mut ids, Reply::Cancel { id: id(2) });
        assert_eq!(outcome.freed, 1);
        assert!(!ids.is_active(id(2)));
        assert_eq!(coordinator.running(), 1);
    }

    #[test]
    fn test_cancel_dependent_keeps_shared_load() {
        let (mut coordinator, transport, mut ids) = setup();
        let load = coordinator.load(&mut ids, "math", false).unwrap();
        let (request, mut rx) = call(7, "add", vec![]);
        coordinator.call(&mut ids, request, false).unwrap();
        transport.take();
        assert_eq!(coordinator.cancel(&mut ids, load).unwrap(), 1);
        assert!(transport.take().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(coordinator.find_call(RequestKey::from(7)), Some(id(3)));
    }

    #[test]
    fn test_cancel_running_call() {
        let (mut coordinator, transport, mut ids) = setup();
        coordinator.load(&mut ids, "math", false).unwrap();
        reply(
            &mut coordinator,
            &mut ids,
            Reply::Load {
                id: id(2),
                methods: Some(BTreeMap::new()),
            },
        );
        let (request, mut rx) = call(1, "add", vec![json!(1).into()]);
        let call_id = coordinator.call(&mut ids, request, true).unwrap();
        transport.take();
        coordinator.cancel(&mut ids, call_id).unwrap();
        assert!(rx.try_recv().unwrap().unwrap_err().is_cancelled());
        assert_eq!(transport.take(), vec![json!([0, 1])]);
        // replies that were in flight are ignored
        reply(&mut coordinator, &mut ids, Reply::Next { id: call_id });
        reply(
            &mut coordinator,
            &mut ids,
            Reply::Return {
                id: call_id,
                value: json!(1).into(),
            },
        );
        assert!(transport.take().is_empty());
        assert_eq!(coordinator.running(), 1);
        assert!(ids.is_active(call_id));
        reply(&mut coordinator, &mut ids, Reply::Cancel { id: call_id });
        assert_eq!(coordinator.running(), 0);
        assert_eq!(ids.active(), 0);
        // a duplicate cancellation is a no-op
        assert_eq!(coordinator.cancel(&mut ids, call_id).unwrap(), 0);
    }

    #[test]
    fn test_failed_load_rejects_calls() {
        let (mut coordinator, _transport, mut ids) = setup();
        let (request, mut rx) = call(1, "add", vec![]);
        coordinator.call(&mut ids, request, false).unwrap();
        let outcome = reply(
            &mut coordinator,
            &mut ids,
            Reply::Throw {
                id: id(2),
                value: RemoteError::new(ErrorKind::Syntax, "bad module").into(),
            },
        );
        assert_eq!(outcome.freed, 1);
        assert!(matches!(
            outcome.load,
            Some(LoadOutcome::Failed { wanted: true, .. })
        ));
        let error = rx.try_recv().unwrap().unwrap_err();
        assert!(
            matches!(error, ExecutionError::Remote(ref e) if e.kind == ErrorKind::Syntax && e.message == "bad module")
        );
        assert_eq!(ids.active(), 0);
    }

    #[test]
    fn test_accepts_handles_only_with_support() {
        let (coordinator, _transport, _ids) = setup();
        let (plain, _rx) = call(1, "serve", vec![json!(1).into()]);
        let (handle, _rx) = call(2, "serve", vec![TransferHandle::new(3u8).into()]);
        assert!(coordinator.accepts(&plain));
        assert!(!coordinator.accepts(&handle));

        let transport = RecordingTransport {
            supports_handles: true,
            ..Default::default()
        };
        let coordinator = Coordinator::new(WorkerId::from(2), Box::new(transport));
        assert!(coordinator.accepts(&handle));
    }

    #[test]
    fn test_unexpected_replies() {
        let (mut coordinator, _transport, mut ids) = setup();
        for reply in [
            Reply::Cancel { id: id(1) },
            Reply::Load {
                id: id(1),
                methods: None,
            },
            Reply::Next { id: id(1) },
            Reply::Return {
                id: id(1),
                value: json!(null).into(),
            },
        ] {
            assert!(matches!(
                coordinator.handle_reply(&mut ids, reply),
                Err(ExecutionError::ProtocolError(_))
            ));
        }
    }

    #[test]
    fn test_abandon_reports_retriable_calls() {
        let (mut coordinator, _transport, mut ids) = setup();
        coordinator.load(&mut ids, "math", false).unwrap();
        let (a, _rx_a) = call(1, "add", vec![json!(1).into()]);
        let (b, _rx_b) = call(2, "add", vec![json!(1).into()]);
        let (c, _rx_c) = call(3, "add", vec![json!(1).into()]);
        reply(
            &mut coordinator,
            &mut ids,
            Reply::Load {
                id: id(2),
                methods: Some(BTreeMap::new()),
            },
        );
        let a = coordinator.call(&mut ids, a, true).unwrap();
        let b = coordinator.call(&mut ids, b, true).unwrap();
        coordinator.call(&mut ids, c, true).unwrap();
        reply(&mut coordinator, &mut ids, Reply::Next { id: b });
        coordinator.cancel(&mut ids, a).unwrap();
        let abandoned = coordinator.abandon(&mut ids);
        let sent = abandoned
            .iter()
            .map(|x| match x {
                AbandonedRequest::Load { .. } => None,
                AbandonedRequest::Call { request, sent } => Some((u64::from(request.key), *sent)),
            })
            .collect::<Vec<_>>();
        assert_eq!(sent, vec![Some((2, true)), Some((3, false))]);
        assert_eq!(ids.active(), 0);
        assert_eq!(coordinator.running(), 0);
    }
}
