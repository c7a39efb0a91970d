//! Dynamic configuration gates.
//!
//! Behaviors that operators tune at runtime (rate limits, per-domain
//! allowlists, retention ceilings) are read through function values passed
//! by parameter. The engine never reads configuration from a global.

use std::sync::Arc;

/// A dynamically-read integer property.
pub type IntPropertyFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A dynamically-read boolean property filtered by domain name.
pub type DomainBoolPropertyFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn fixed_int(value: i64) -> IntPropertyFn {
    Arc::new(move || value)
}

pub fn domain_bool(value: bool) -> DomainBoolPropertyFn {
    Arc::new(move |_| value)
}

/// Static engine settings. Dynamic gates stay function-valued; these are
/// process-lifetime constants.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub num_shards: i32,
    /// Upper bound on the execution cache, in estimated bytes.
    pub execution_cache_max_bytes: usize,
    /// Batch size for scavenger branch listing.
    pub scavenger_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_shards: 16 * 1024,
            execution_cache_max_bytes: 256 * 1024 * 1024,
            scavenger_page_size: 1000,
        }
    }
}
