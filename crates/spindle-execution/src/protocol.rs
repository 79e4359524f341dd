//! Protocol messages exchanged between the pool and its workers.
//!
//! Every message is a tuple `[type, id, ...fields]` carried in an [`Envelope`],
//! where `id` is the request identifier allocated by the pool.
//!
//! ```text
//! pool -> worker                         worker -> pool
//! [Load, id, module]                     [Load, id, {method: arity}] | [Throw, id, ...]
//! [LateLoad, id, module]                 [Load, id] | [Throw, id, ...]
//! [Init, id, module, method]             [Next, id]
//! [Add, id, ...payload]                  [Next, id]
//! [Invoke, id]                           [Return, id, ...payload] | [Throw, id, ...payload]
//! [Cancel, id]                           [Cancel, id]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::Value as JsonValue;

use crate::codec::{Payload, TransferHandle, Value};
use crate::error::{ExecutionError, ExecutionResult};
use crate::id::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Cancel = 0,
    Load = 1,
    LateLoad = 2,
    Init = 3,
    Add = 4,
    Invoke = 5,
    Next = 6,
    Return = 7,
    Throw = 8,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A message on the wire, with an optional handle passed beside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Vec<JsonValue>,
    pub handle: Option<TransferHandle>,
    /// Whether the sender keeps its side of the handle open after the transfer.
    pub keep_open: bool,
}

impl Envelope {
    fn new(message_type: MessageType, id: RequestId, fields: Vec<JsonValue>) -> Self {
        let mut message = vec![u8::from(message_type).into(), u32::from(id).into()];
        message.extend(fields);
        Self {
            message,
            handle: None,
            keep_open: false,
        }
    }

    fn with_payload(message_type: MessageType, id: RequestId, value: Value) -> Self {
        let Payload { fields, handle } = Payload::encode(value);
        let mut envelope = Self::new(message_type, id, fields);
        envelope.handle = handle;
        envelope
    }

    /// Parses a message from one line of JSON text.
    pub fn from_json_line(line: &str) -> ExecutionResult<Self> {
        match serde_json::from_str(line)? {
            JsonValue::Array(message) => Ok(Self {
                message,
                handle: None,
                keep_open: false,
            }),
            x => Err(ExecutionError::protocol(format!("invalid message: {x}"))),
        }
    }

    /// Formats the message as one line of JSON text without the line terminator.
    /// Handles cannot be represented as text.
    pub fn to_json_line(&self) -> ExecutionResult<String> {
        if self.handle.is_some() {
            return Err(ExecutionError::protocol(
                "cannot send a handle over a text stream",
            ));
        }
        Ok(serde_json::to_string(&self.message)?)
    }

    /// Parses the message type and the request ID, returning the remaining fields.
    fn split(self) -> ExecutionResult<(MessageType, RequestId, Fields)> {
        let Envelope {
            message,
            handle,
            keep_open,
        } = self;
        let mut fields = message.into_iter();
        let message_type = fields
            .next()
            .and_then(|x| x.as_u64())
            .and_then(|x| u8::try_from(x).ok())
            .and_then(|x| MessageType::try_from(x).ok())
            .ok_or_else(|| ExecutionError::protocol("invalid message type"))?;
        let id = fields
            .next()
            .and_then(|x| x.as_u64())
            .and_then(|x| u32::try_from(x).ok())
            .filter(|x| *x > 0)
            .ok_or_else(|| ExecutionError::protocol("invalid request ID"))?;
        Ok((
            message_type,
            RequestId::from(id),
            Fields {
                fields: fields.collect(),
                handle,
                keep_open,
            },
        ))
    }
}

struct Fields {
    fields: Vec<JsonValue>,
    handle: Option<TransferHandle>,
    keep_open: bool,
}

impl Fields {
    fn string(&mut self, index: usize, name: &str) -> ExecutionResult<String> {
        match self.fields.get_mut(index).map(JsonValue::take) {
            Some(JsonValue::String(x)) => Ok(x),
            _ => Err(ExecutionError::protocol(format!("missing {name}"))),
        }
    }

    fn payload(self) -> ExecutionResult<Value> {
        Payload {
            fields: self.fields,
            handle: self.handle,
        }
        .decode()
    }
}

/// A message sent from the pool to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Cancel {
        id: RequestId,
    },
    /// Loads a module that is not yet known to the pool.
    /// The worker replies with the method table.
    Load {
        id: RequestId,
        module: String,
    },
    /// Loads a module that the pool has already cached.
    /// The worker replies without the method table.
    LateLoad {
        id: RequestId,
        module: String,
    },
    Init {
        id: RequestId,
        module: String,
        method: String,
    },
    Add {
        id: RequestId,
        value: Value,
        keep_open: bool,
    },
    Invoke {
        id: RequestId,
    },
}

impl Request {
    pub fn id(&self) -> RequestId {
        match self {
            Request::Cancel { id }
            | Request::Load { id, .. }
            | Request::LateLoad { id, .. }
            | Request::Init { id, .. }
            | Request::Add { id, .. }
            | Request::Invoke { id } => *id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Cancel { .. } => MessageType::Cancel,
            Request::Load { .. } => MessageType::Load,
            Request::LateLoad { .. } => MessageType::LateLoad,
            Request::Init { .. } => MessageType::Init,
            Request::Add { .. } => MessageType::Add,
            Request::Invoke { .. } => MessageType::Invoke,
        }
    }

    pub fn encode(self) -> Envelope {
        let message_type = self.message_type();
        match self {
            Request::Cancel { id } | Request::Invoke { id } => {
                Envelope::new(message_type, id, vec![])
            }
            Request::Load { id, module } | Request::LateLoad { id, module } => {
                Envelope::new(message_type, id, vec![module.into()])
            }
            Request::Init { id, module, method } => {
                Envelope::new(message_type, id, vec![module.into(), method.into()])
            }
            Request::Add {
                id,
                value,
                keep_open,
            } => {
                let mut envelope = Envelope::with_payload(message_type, id, value);
                envelope.keep_open = keep_open;
                envelope
            }
        }
    }

    pub fn decode(envelope: Envelope) -> ExecutionResult<Self> {
        let (message_type, id, mut fields) = envelope.split()?;
        match message_type {
            MessageType::Cancel => Ok(Request::Cancel { id }),
            MessageType::Load => Ok(Request::Load {
                id,
                module: fields.string(0, "module name")?,
            }),
            MessageType::LateLoad => Ok(Request::LateLoad {
                id,
                module: fields.string(0, "module name")?,
            }),
            MessageType::Init => Ok(Request::Init {
                id,
                module: fields.string(0, "module name")?,
                method: fields.string(1, "method name")?,
            }),
            MessageType::Add => {
                let keep_open = fields.keep_open;
                Ok(Request::Add {
                    id,
                    value: fields.payload()?,
                    keep_open,
                })
            }
            MessageType::Invoke => Ok(Request::Invoke { id }),
            x @ (MessageType::Next | MessageType::Return | MessageType::Throw) => Err(
                ExecutionError::protocol(format!("unexpected message type for worker: {x}")),
            ),
        }
    }
}

/// A message sent from a worker to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Acknowledges a cancellation.
    Cancel {
        id: RequestId,
    },
    /// Reports a successful module load, with the method arities
    /// if the request was [`Request::Load`].
    Load {
        id: RequestId,
        methods: Option<BTreeMap<String, usize>>,
    },
    /// Requests the next argument of a call.
    Next {
        id: RequestId,
    },
    Return {
        id: RequestId,
        value: Value,
    },
    Throw {
        id: RequestId,
        value: Value,
    },
}

impl Reply {
    pub fn id(&self) -> RequestId {
        match self {
            Reply::Cancel { id }
            | Reply::Load { id, .. }
            | Reply::Next { id }
            | Reply::Return { id, .. }
            | Reply::Throw { id, .. } => *id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Reply::Cancel { .. } => MessageType::Cancel,
            Reply::Load { .. } => MessageType::Load,
            Reply::Next { .. } => MessageType::Next,
            Reply::Return { .. } => MessageType::Return,
            Reply::Throw { .. } => MessageType::Throw,
        }
    }

    pub fn encode(self) -> Envelope {
        let message_type = self.message_type();
        match self {
            Reply::Cancel { id } | Reply::Next { id } => Envelope::new(message_type, id, vec![]),
            Reply::Load { id, methods } => {
                let fields = match methods {
                    Some(methods) => vec![JsonValue::Object(
                        methods
                            .into_iter()
                            .map(|(name, arity)| (name, arity.into()))
                            .collect(),
                    )],
                    None => vec![],
                };
                Envelope::new(message_type, id, fields)
            }
            Reply::Return { id, value } | Reply::Throw { id, value } => {
                Envelope::with_payload(message_type, id, value)
            }
        }
    }

    pub fn decode(envelope: Envelope) -> ExecutionResult<Self> {
        let (message_type, id, fields) = envelope.split()?;
        match message_type {
            MessageType::Cancel => Ok(Reply::Cancel { id }),
            MessageType::Load => {
                let methods = match fields.fields.into_iter().next() {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::Object(x)) => Some(
                        x.into_iter()
                            .map(|(name, arity)| {
                                let arity = arity
                                    .as_u64()
                                    .and_then(|x| usize::try_from(x).ok())
                                    .ok_or_else(|| {
                                        ExecutionError::protocol(format!(
                                            "invalid arity for method {name}"
                                        ))
                                    })?;
                                Ok((name, arity))
                            })
                            .collect::<ExecutionResult<_>>()?,
                    ),
                    Some(x) => {
                        return Err(ExecutionError::protocol(format!(
                            "invalid method table: {x}"
                        )))
                    }
                };
                Ok(Reply::Load { id, methods })
            }
            MessageType::Next => Ok(Reply::Next { id }),
            MessageType::Return => Ok(Reply::Return {
                id,
                value: fields.payload()?,
            }),
            MessageType::Throw => Ok(Reply::Throw {
                id,
                value: fields.payload()?,
            }),
            x @ (MessageType::LateLoad
            | MessageType::Init
            | MessageType::Add
            | MessageType::Invoke) => Err(ExecutionError::protocol(format!(
                "unexpected message type for pool: {x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::{ErrorKind, RemoteError};

    fn id(value: u32) -> RequestId {
        RequestId::from(value)
    }

    #[test]
    fn test_request_wire_form() {
        let cases = vec![
            (Request::Cancel { id: id(1) }, json!([0, 1])),
            (
                Request::Load {
                    id: id(2),
                    module: "math".to_string(),
                },
                json!([1, 2, "math"]),
            ),
            (
                Request::LateLoad {
                    id: id(3),
                    module: "math".to_string(),
                },
                json!([2, 3, "math"]),
            ),
            (
                Request::Init {
                    id: id(4),
                    module: "math".to_string(),
                    method: "add".to_string(),
                },
                json!([3, 4, "math", "add"]),
            ),
            (
                Request::Add {
                    id: id(5),
                    value: Value::Data(json!({"x": 1})),
                    keep_open: false,
                },
                json!([4, 5, 1, {"x": 1}]),
            ),
            (Request::Invoke { id: id(6) }, json!([5, 6])),
        ];
        for (request, expected) in cases {
            let envelope = request.clone().encode();
            assert_eq!(JsonValue::Array(envelope.message.clone()), expected);
            assert_eq!(Request::decode(envelope).ok(), Some(request));
        }
    }

    #[test]
    fn test_reply_wire_form() {
        let methods = BTreeMap::from([("add".to_string(), 2), ("neg".to_string(), 1)]);
        let cases = vec![
            (Reply::Cancel { id: id(1) }, json!([0, 1])),
            (
                Reply::Load {
                    id: id(2),
                    methods: Some(methods),
                },
                json!([1, 2, {"add": 2, "neg": 1}]),
            ),
            (
                Reply::Load {
                    id: id(2),
                    methods: None,
                },
                json!([1, 2]),
            ),
            (Reply::Next { id: id(3) }, json!([6, 3])),
            (
                Reply::Return {
                    id: id(4),
                    value: Value::Data(json!(3)),
                },
                json!([7, 4, 1, 3]),
            ),
            (
                Reply::Throw {
                    id: id(5),
                    value: Value::Error(RemoteError::new(ErrorKind::Syntax, "oops")),
                },
                json!([8, 5, 6, {}, "oops", null]),
            ),
        ];
        for (reply, expected) in cases {
            let envelope = reply.clone().encode();
            assert_eq!(JsonValue::Array(envelope.message.clone()), expected);
            assert_eq!(Reply::decode(envelope).ok(), Some(reply));
        }
    }

    #[test]
    fn test_add_carries_handle_beside_message() {
        let handle = TransferHandle::new("socket");
        let envelope = Request::Add {
            id: id(9),
            value: Value::Handle(handle.clone()),
            keep_open: true,
        }
        .encode();
        assert_eq!(envelope.message, vec![json!(4), json!(9), json!(0)]);
        assert_eq!(envelope.handle.as_ref(), Some(&handle));
        assert!(envelope.keep_open);
    }

    #[test]
    fn test_invalid_messages() {
        let invalid = vec![
            json!([]),
            json!([42, 1]),
            json!([0, 0]),
            json!([0, -1]),
            json!(["load", 1]),
            json!([1, 1]),
            json!([3, 1, "math"]),
            json!([6, 1]),
        ];
        for message in invalid {
            let JsonValue::Array(message) = message else {
                unreachable!()
            };
            let envelope = Envelope {
                message,
                handle: None,
                keep_open: false,
            };
            assert!(matches!(
                Request::decode(envelope),
                Err(ExecutionError::ProtocolError(_))
            ));
        }
    }

    #[test]
    fn test_json_lines() {
        let envelope = Request::Init {
            id: id(7),
            module: "math".to_string(),
            method: "add".to_string(),
        }
        .encode();
        let line = envelope.to_json_line().ok();
        assert_eq!(line.as_deref(), Some(r#"[3,7,"math","add"]"#));
        assert_eq!(Envelope::from_json_line(r#"[3,7,"math","add"]"#).ok(), Some(envelope));
        assert!(Envelope::from_json_line(r#"{"type":3}"#).is_err());
        assert!(Envelope::from_json_line("[3,7").is_err());
        let envelope = Request::Add {
            id: id(1),
            value: Value::Handle(TransferHandle::new(0u8)),
            keep_open: false,
        }
        .encode();
        assert!(envelope.to_json_line().is_err());
    }

    #[test]
    fn test_reply_rejects_pool_messages() {
        let envelope = Request::Invoke { id: id(1) }.encode();
        assert!(matches!(
            Reply::decode(envelope),
            Err(ExecutionError::ProtocolError(_))
        ));
    }
}
