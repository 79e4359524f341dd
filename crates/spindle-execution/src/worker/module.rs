use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::codec::{ErrorKind, RemoteError, Value};

pub type MethodResult = Result<Value, RemoteError>;

/// What a method returns when invoked: either the result itself,
/// or a future that the worker awaits while serving other requests.
pub enum MethodOutput {
    Ready(MethodResult),
    Pending(BoxFuture<'static, MethodResult>),
}

impl MethodOutput {
    pub fn ready(value: impl Into<Value>) -> Self {
        MethodOutput::Ready(Ok(value.into()))
    }

    pub fn error(error: RemoteError) -> Self {
        MethodOutput::Ready(Err(error))
    }

    pub fn pending(future: impl Future<Output = MethodResult> + Send + 'static) -> Self {
        MethodOutput::Pending(future.boxed())
    }
}

type MethodFunction = dyn Fn(Vec<Value>) -> MethodOutput + Send + Sync;

#[derive(Clone)]
pub struct Method {
    arity: usize,
    function: Arc<MethodFunction>,
}

impl Method {
    /// Creates a method with its declared number of parameters.
    /// The arity is informational, and the method receives every argument the caller passes.
    pub fn new(
        arity: usize,
        function: impl Fn(Vec<Value>) -> MethodOutput + Send + Sync + 'static,
    ) -> Self {
        Self {
            arity,
            function: Arc::new(function),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub(crate) fn invoke(&self, args: Vec<Value>) -> MethodOutput {
        (self.function)(args)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// The exported methods of a module.
#[derive(Debug, Clone, Default)]
pub struct ModuleDefinition {
    methods: BTreeMap<String, Method>,
}

impl ModuleDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, name: impl Into<String>, method: Method) -> Self {
        self.methods.insert(name.into(), method);
        self
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn arities(&self) -> BTreeMap<String, usize> {
        self.methods
            .iter()
            .map(|(name, method)| (name.clone(), method.arity))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Resolves module names to module definitions inside a worker.
pub trait ModuleLoader: Send + Sync + 'static {
    fn load(&self, name: &str) -> Result<ModuleDefinition, RemoteError>;

    /// Forgets anything cached for a module that failed to load,
    /// so that a later load starts from scratch.
    fn uncache(&self, _name: &str) {}
}

type ModuleFactory = Arc<dyn Fn() -> Result<ModuleDefinition, RemoteError> + Send + Sync>;

/// A module loader backed by a fixed set of named module factories.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(
        mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Result<ModuleDefinition, RemoteError> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_module(self, name: impl Into<String>, definition: ModuleDefinition) -> Self {
        self.with_factory(name, move || Ok(definition.clone()))
    }
}

impl ModuleLoader for ModuleRegistry {
    fn load(&self, name: &str) -> Result<ModuleDefinition, RemoteError> {
        match self.factories.get(name) {
            Some(factory) => factory(),
            None => Err(RemoteError::new(
                ErrorKind::Error,
                format!("cannot find module '{name}'"),
            )),
        }
    }
}
