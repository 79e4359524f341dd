use std::borrow::Cow;

/// Common span attribute names.
/// The name either follow the OpenTelemetry semantic conventions,
/// or is specific to Spindle.
pub struct SpanAttribute;

impl SpanAttribute {
    pub const EXCEPTION_MESSAGE: &'static str = "exception.message";
    pub const EXCEPTION_TYPE: &'static str = "exception.type";
    pub const RETRY_ATTEMPT: &'static str = "retry.attempt";
    pub const POOL_WORKER_ID: &'static str = "pool.worker.id";
    pub const POOL_REQUEST_KEY: &'static str = "pool.request.key";
    pub const POOL_MODULE_NAME: &'static str = "pool.module.name";
    pub const POOL_METHOD_NAME: &'static str = "pool.method.name";
    pub const PROTOCOL_MESSAGE_TYPE: &'static str = "protocol.message.type";
    pub const PROTOCOL_REQUEST_ID: &'static str = "protocol.request.id";
}

/// A trait for associating an object with a span.
/// The extracted information from the associated object
/// can be used for span names and properties.
pub trait SpanAssociation {
    /// The name of the object associated with the span.
    fn name(&self) -> Cow<'static, str>;

    /// The properties of the object associated with the span.
    fn properties(&self) -> impl IntoIterator<Item = (Cow<'static, str>, Cow<'static, str>)>;
}
