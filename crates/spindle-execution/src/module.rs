use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::Value;
use crate::driver::{CallOptions, Pool};
use crate::error::{ExecutionError, ExecutionResult};

struct ModuleEntry {
    name: String,
    methods: BTreeMap<String, usize>,
    pool: Pool,
}

/// A module loaded by the pool.
///
/// There is one entry per module name in each pool, shared by every load
/// request for the module. Calls made through the handle are scheduled on
/// any worker of the pool, loading the module there first if needed.
#[derive(Clone)]
pub struct ModuleHandle {
    entry: Arc<ModuleEntry>,
}

impl ModuleHandle {
    pub(crate) fn new(name: String, methods: BTreeMap<String, usize>, pool: Pool) -> Self {
        Self {
            entry: Arc::new(ModuleEntry {
                name,
                methods,
                pool,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// The method names and their declared arities.
    pub fn methods(&self) -> &BTreeMap<String, usize> {
        &self.entry.methods
    }

    pub fn arity(&self, method: &str) -> Option<usize> {
        self.entry.methods.get(method).copied()
    }

    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> ExecutionResult<Value> {
        if !self.entry.methods.contains_key(method) {
            return Err(ExecutionError::invalid(format!(
                "module {} has no method {method}",
                self.entry.name
            )));
        }
        self.entry
            .pool
            .call(&self.entry.name, method, args, options)
            .await
    }

    /// Whether the two handles refer to the same cached module.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.entry.name)
            .field("methods", &self.entry.methods)
            .finish()
    }
}
