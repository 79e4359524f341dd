mod actor;
mod entrypoint;
mod event;
mod module;
mod options;

pub use actor::WorkerActor;
pub use entrypoint::run_worker;
pub(crate) use entrypoint::READY_LINE;
pub use event::WorkerEvent;
pub use module::{Method, MethodOutput, MethodResult, ModuleDefinition, ModuleLoader, ModuleRegistry};
pub use options::WorkerOptions;
