use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Remote compute service URL. Without one, heavy work also runs locally.
    pub endpoint: Option<String>,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    /// Global evolution over more active regions than this is heavy.
    pub heavy_global_threshold: usize,
}

impl RouterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5_000,
            retry: RetryConfig::default(),
            heavy_global_threshold: 64,
        }
    }
}
