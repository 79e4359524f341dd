use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::error;
use spindle_common::config::AppConfig;
use tokio_util::sync::CancellationToken;

use crate::codec::{TransferHandle, Value};
use crate::error::{ExecutionError, ExecutionResult};

/// The handler for errors that are not tied to any request,
/// such as worker crashes and launch failures.
pub type ErrorHandler = Arc<dyn Fn(&ExecutionError) + Send + Sync>;

fn default_error_handler() -> ErrorHandler {
    Arc::new(|e: &ExecutionError| error!("worker pool error: {e}"))
}

fn default_limit() -> usize {
    std::thread::available_parallelism()
        .map(|x| x.get())
        .unwrap_or(1)
        + 1
}

#[readonly::make]
#[derive(Clone)]
pub struct PoolOptions {
    pub working_directory: PathBuf,
    /// Environment variables added to the inherited environment of each worker.
    pub environment: HashMap<String, String>,
    /// The maximum number of workers, at least [`PoolOptions::minimum`].
    pub limit: usize,
    /// The number of workers maintained even when idle or after crashes, at least one.
    pub minimum: usize,
    /// The maximum number of concurrent requests per worker, where zero means no limit.
    pub max_per_child: usize,
    /// How long an idle worker is kept before it is stopped.
    pub idle_timeout: Duration,
    /// The number of times a failed worker launch is retried.
    pub retries: usize,
    pub retry_delay: Duration,
    pub launch_timeout: Duration,
    pub error_handler: ErrorHandler,
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("working_directory", &self.working_directory)
            .field("environment", &self.environment)
            .field("limit", &self.limit)
            .field("minimum", &self.minimum)
            .field("max_per_child", &self.max_per_child)
            .field("idle_timeout", &self.idle_timeout)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("launch_timeout", &self.launch_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("."),
            environment: HashMap::new(),
            limit: default_limit(),
            minimum: 1,
            max_per_child: 0,
            idle_timeout: Duration::from_secs(30),
            retries: 5,
            retry_delay: Duration::ZERO,
            launch_timeout: Duration::from_secs(30),
            error_handler: default_error_handler(),
        }
    }
}

impl PoolOptions {
    pub fn new(config: &AppConfig) -> ExecutionResult<Self> {
        let pool = &config.pool;
        let current = std::env::current_dir()?;
        let working_directory = if pool.working_directory.is_empty() {
            current
        } else {
            current.join(&pool.working_directory)
        };
        let limit = if pool.limit == 0 {
            default_limit()
        } else {
            pool.limit
        };
        let options = Self {
            working_directory,
            environment: pool.environment.clone(),
            limit,
            minimum: pool.minimum,
            max_per_child: pool.max_per_child,
            idle_timeout: Duration::from_millis(pool.idle_timeout_ms),
            retries: pool.retries,
            retry_delay: Duration::from_millis(pool.retry_delay_ms),
            launch_timeout: Duration::from_millis(pool.launch_timeout_ms),
            error_handler: default_error_handler(),
        };
        Ok(options.normalize())
    }

    fn normalize(mut self) -> Self {
        self.minimum = self.minimum.max(1);
        self.limit = self.limit.max(self.minimum);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self.normalize()
    }

    pub fn with_minimum(mut self, minimum: usize) -> Self {
        self.minimum = minimum;
        self.normalize()
    }

    pub fn with_max_per_child(mut self, max_per_child: usize) -> Self {
        self.max_per_child = max_per_child;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_retries(mut self, retries: usize, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_launch_timeout(mut self, launch_timeout: Duration) -> Self {
        self.launch_timeout = launch_timeout;
        self
    }

    pub fn with_working_directory(mut self, working_directory: impl Into<PathBuf>) -> Self {
        self.working_directory = working_directory.into();
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&ExecutionError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }
}

/// Which call arguments are transferred with the sender's side kept open.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum KeepOpen {
    #[default]
    None,
    All,
    /// Only the arguments at these positions.
    Positions(Vec<usize>),
    /// Only the arguments that are one of these handles.
    Handles(Vec<TransferHandle>),
}

impl KeepOpen {
    pub(crate) fn applies(&self, position: usize, value: &Value) -> bool {
        match self {
            KeepOpen::None => false,
            KeepOpen::All => true,
            KeepOpen::Positions(positions) => positions.contains(&position),
            KeepOpen::Handles(handles) => match value {
                Value::Handle(handle) => handles.contains(handle),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cancel: Option<CancellationToken>,
    pub keep_open: KeepOpen,
    /// Whether the call is submitted again if the worker dies after the call
    /// has been fully sent. The method may then run more than once.
    pub resubmit_on_crash: bool,
}

impl CallOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_keep_open(mut self, keep_open: KeepOpen) -> Self {
        self.keep_open = keep_open;
        self
    }

    pub fn with_resubmit_on_crash(mut self, resubmit: bool) -> Self {
        self.resubmit_on_crash = resubmit;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub cancel: Option<CancellationToken>,
}

impl LoadOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_pool_options_normalization() {
        let options = PoolOptions::default().with_minimum(0).with_limit(0);
        assert_eq!(options.minimum, 1);
        assert_eq!(options.limit, 1);
        let options = PoolOptions::default().with_limit(2).with_minimum(4);
        assert_eq!(options.limit, 4);
        assert_eq!(options.minimum, 4);
    }

    #[test]
    fn test_keep_open_applies() {
        let handle = TransferHandle::new(1u32);
        let other = TransferHandle::new(1u32);
        let data = Value::Data(json!(1));
        assert!(!KeepOpen::None.applies(0, &data));
        assert!(KeepOpen::All.applies(3, &data));
        assert!(KeepOpen::Positions(vec![1]).applies(1, &data));
        assert!(!KeepOpen::Positions(vec![1]).applies(0, &data));
        let keep = KeepOpen::Handles(vec![handle.clone()]);
        assert!(keep.applies(5, &Value::Handle(handle)));
        assert!(!keep.applies(5, &Value::Handle(other)));
        assert!(!keep.applies(5, &data));
    }
}
