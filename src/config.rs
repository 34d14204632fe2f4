//! Process-wide runtime configuration.
//!
//! Read once in `main` before any worker pool is created and immutable
//! afterwards. Library code reads it through [`current`].

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Runtime configuration shared by the whole process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of parallel workers used to walk the DAG
    pub num_workers: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Per-invocation timeout for installer targets, in seconds
    pub installer_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 5,
            log_level: "info".to_string(),
            installer_timeout: 600,
        }
    }
}

static CURRENT: OnceLock<Config> = OnceLock::new();

/// Install the process-wide config. Later calls are ignored.
pub fn init(config: Config) {
    let _ = CURRENT.set(config);
}

/// The active config, or defaults if `init` was never called (tests)
pub fn current() -> &'static Config {
    CURRENT.get_or_init(Config::default)
}
