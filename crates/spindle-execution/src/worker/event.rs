use std::borrow::Cow;

use spindle_telemetry::common::{SpanAssociation, SpanAttribute};

use crate::id::RequestId;
use crate::protocol::Envelope;
use crate::worker::module::MethodResult;

pub enum WorkerEvent {
    /// A message from the pool.
    Message {
        envelope: Envelope,
    },
    RunLoad {
        id: RequestId,
    },
    RunInvoke {
        id: RequestId,
    },
    MethodCompleted {
        id: RequestId,
        /// Distinguishes the invocation from a later one that reuses the request ID.
        sequence: u64,
        result: MethodResult,
    },
    Shutdown,
}

impl SpanAssociation for WorkerEvent {
    fn name(&self) -> Cow<'static, str> {
        let name = match self {
            WorkerEvent::Message { .. } => "Message",
            WorkerEvent::RunLoad { .. } => "RunLoad",
            WorkerEvent::RunInvoke { .. } => "RunInvoke",
            WorkerEvent::MethodCompleted { .. } => "MethodCompleted",
            WorkerEvent::Shutdown => "Shutdown",
        };
        name.into()
    }

    fn properties(&self) -> impl IntoIterator<Item = (Cow<'static, str>, Cow<'static, str>)> {
        let mut p: Vec<(&'static str, String)> = vec![];
        match self {
            WorkerEvent::Message { envelope } => {
                if let Some(x) = envelope.message.first() {
                    p.push((SpanAttribute::PROTOCOL_MESSAGE_TYPE, x.to_string()));
                }
                if let Some(x) = envelope.message.get(1) {
                    p.push((SpanAttribute::PROTOCOL_REQUEST_ID, x.to_string()));
                }
            }
            WorkerEvent::RunLoad { id } | WorkerEvent::RunInvoke { id } => {
                p.push((SpanAttribute::PROTOCOL_REQUEST_ID, id.to_string()));
            }
            WorkerEvent::MethodCompleted { id, result, .. } => {
                p.push((SpanAttribute::PROTOCOL_REQUEST_ID, id.to_string()));
                if let Err(e) = result {
                    p.push((SpanAttribute::EXCEPTION_TYPE, e.kind.to_string()));
                    p.push((SpanAttribute::EXCEPTION_MESSAGE, e.message.clone()));
                }
            }
            WorkerEvent::Shutdown => {}
        }
        p.into_iter().map(|(k, v)| (k.into(), v.into()))
    }
}
