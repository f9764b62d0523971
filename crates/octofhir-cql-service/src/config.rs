//! CQL service configuration

use serde::{Deserialize, Serialize};

/// Configuration for CQL evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CqlConfig {
    /// Maximum resources per retrieve (prevent memory exhaustion)
    #[serde(default = "default_max_retrieve_size")]
    pub max_retrieve_size: usize,

    /// Decoded library source cache capacity
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Expression evaluation timeout (ms)
    #[serde(default = "default_evaluation_timeout")]
    pub evaluation_timeout_ms: u64,
}

impl Default for CqlConfig {
    fn default() -> Self {
        Self {
            max_retrieve_size: default_max_retrieve_size(),
            cache_capacity: default_cache_capacity(),
            evaluation_timeout_ms: default_evaluation_timeout(),
        }
    }
}

fn default_max_retrieve_size() -> usize {
    10_000
}

fn default_cache_capacity() -> usize {
    1_000
}

fn default_evaluation_timeout() -> u64 {
    30_000
}
