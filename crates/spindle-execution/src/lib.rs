pub mod codec;
pub mod driver;
pub mod error;
pub mod id;
mod module;
pub mod protocol;
pub mod worker;
pub mod worker_manager;

pub use driver::Pool;
pub use module::ModuleHandle;
pub use worker::run_worker;
