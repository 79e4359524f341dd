use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WorkerLaunchOptions {
    pub working_directory: PathBuf,
    pub environment: HashMap<String, String>,
}
