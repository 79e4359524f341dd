use std::collections::HashMap;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// The prefix of environment variables that override the default configuration.
/// Nested keys are separated by double underscores, e.g. `SPINDLE__POOL__LIMIT`.
pub const CONFIG_ENV_PREFIX: &str = "SPINDLE__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed(CONFIG_ENV_PREFIX).map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::invalid(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub working_directory: String,
    pub environment: HashMap<String, String>,
    pub limit: usize,
    pub minimum: usize,
    pub max_per_child: usize,
    pub idle_timeout_ms: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub launch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The executable that serves the worker protocol over standard I/O.
    pub program: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub trace_to_console: bool,
}
