use std::time::Duration;

use spindle_server::RetryStrategy;

use crate::driver::options::{ErrorHandler, PoolOptions};
use crate::worker_manager::WorkerLaunchOptions;

#[derive(Clone)]
pub(crate) struct WorkerPoolOptions {
    pub limit: usize,
    pub minimum: usize,
    pub max_per_child: usize,
    pub idle_timeout: Duration,
    pub launch_timeout: Duration,
    pub launch_retry_strategy: RetryStrategy,
    pub launch: WorkerLaunchOptions,
    pub error_handler: ErrorHandler,
}

impl From<&PoolOptions> for WorkerPoolOptions {
    fn from(options: &PoolOptions) -> Self {
        Self {
            limit: options.limit,
            minimum: options.minimum,
            max_per_child: options.max_per_child,
            idle_timeout: options.idle_timeout,
            launch_timeout: options.launch_timeout,
            launch_retry_strategy: RetryStrategy::Fixed {
                max_count: options.retries,
                delay: options.retry_delay,
            },
            launch: WorkerLaunchOptions {
                working_directory: options.working_directory.clone(),
                environment: options.environment.clone(),
            },
            error_handler: options.error_handler.clone(),
        }
    }
}
