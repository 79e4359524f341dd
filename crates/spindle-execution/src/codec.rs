//! The payload codec for values exchanged with workers.
//!
//! A payload occupies the trailing fields of a protocol message:
//!
//! - `[0]` for a transferable handle, which travels beside the message,
//! - `[1, value]` for a plain JSON value,
//! - `[kind, properties, message, stack]` for an error, where `kind` is one of
//!   the [`ErrorKind`] codes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::error::{ExecutionError, ExecutionResult};

const HANDLE_KIND: u8 = 0;
const VALUE_KIND: u8 = 1;

/// The recognized error kinds. The discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ErrorKind {
    Error = 2,
    Eval = 3,
    Range = 4,
    Reference = 5,
    Syntax = 6,
    Type = 7,
    Uri = 8,
    Custom = 9,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Error => "Error",
            ErrorKind::Eval => "EvalError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Uri => "URIError",
            ErrorKind::Custom => "CustomError",
        };
        write!(f, "{name}")
    }
}

/// An error raised by a worker, carried back to the caller faithfully.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    /// Additional properties attached to the error.
    pub properties: Map<String, JsonValue>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An opaque resource (e.g. an I/O handle) that is passed beside a message
/// rather than encoded inside it.
/// Two handles are equal if and only if they share the same underlying resource.
#[derive(Clone)]
pub struct TransferHandle(Arc<dyn Any + Send + Sync>);

impl TransferHandle {
    pub fn new<T: Any + Send + Sync>(resource: T) -> Self {
        Self(Arc::new(resource))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl PartialEq for TransferHandle {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferHandle({:p})", Arc::as_ptr(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Data(JsonValue),
    Error(RemoteError),
    Handle(TransferHandle),
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::Data(value)
    }
}

impl From<RemoteError> for Value {
    fn from(value: RemoteError) -> Self {
        Value::Error(value)
    }
}

impl From<TransferHandle> for Value {
    fn from(value: TransferHandle) -> Self {
        Value::Handle(value)
    }
}

impl From<Value> for RemoteError {
    /// Converts a thrown value into an error.
    /// Workers may throw values that are not errors, and such values are
    /// wrapped in a custom error that keeps the original value as a property.
    fn from(value: Value) -> Self {
        match value {
            Value::Error(e) => e,
            Value::Data(value) => RemoteError::new(ErrorKind::Custom, value.to_string())
                .with_property("value", value),
            Value::Handle(_) => RemoteError::new(ErrorKind::Custom, "a handle was thrown"),
        }
    }
}

/// The encoded form of a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub fields: Vec<JsonValue>,
    pub handle: Option<TransferHandle>,
}

impl Payload {
    pub fn encode(value: Value) -> Self {
        match value {
            Value::Handle(handle) => Self {
                fields: vec![HANDLE_KIND.into()],
                handle: Some(handle),
            },
            Value::Data(value) => Self {
                fields: vec![VALUE_KIND.into(), value],
                handle: None,
            },
            Value::Error(RemoteError {
                kind,
                message,
                stack,
                properties,
            }) => Self {
                fields: vec![
                    u8::from(kind).into(),
                    JsonValue::Object(properties),
                    JsonValue::String(message),
                    stack.map(JsonValue::String).unwrap_or(JsonValue::Null),
                ],
                handle: None,
            },
        }
    }

    pub fn decode(self) -> ExecutionResult<Value> {
        let Payload { fields, handle } = self;
        let mut fields = fields.into_iter();
        let kind = fields
            .next()
            .and_then(|x| x.as_u64())
            .ok_or_else(|| ExecutionError::protocol("missing payload kind"))?;
        let kind = u8::try_from(kind)
            .map_err(|_| ExecutionError::protocol(format!("unknown payload kind: {kind}")))?;
        match kind {
            HANDLE_KIND => handle
                .map(Value::Handle)
                .ok_or_else(|| ExecutionError::protocol("missing transferable handle")),
            VALUE_KIND => Ok(Value::Data(fields.next().unwrap_or(JsonValue::Null))),
            _ => {
                let kind = ErrorKind::try_from(kind).map_err(|_| {
                    ExecutionError::protocol(format!("unknown payload kind: {kind}"))
                })?;
                let properties = match fields.next() {
                    Some(JsonValue::Object(x)) => x,
                    None | Some(JsonValue::Null) => Map::new(),
                    Some(x) => {
                        return Err(ExecutionError::protocol(format!(
                            "invalid error properties: {x}"
                        )))
                    }
                };
                let message = match fields.next() {
                    Some(JsonValue::String(x)) => x,
                    None | Some(JsonValue::Null) => String::new(),
                    Some(x) => x.to_string(),
                };
                let stack = match fields.next() {
                    Some(JsonValue::String(x)) => Some(x),
                    _ => None,
                };
                Ok(Value::Error(RemoteError {
                    kind,
                    message,
                    stack,
                    properties,
                }))
            }
        }
    }
}
