pub mod handle;
pub mod registry;
pub mod worker;

pub use handle::{ExecutionMode, Scheduler};
pub use registry::SchedulerRegistry;

use std::time::Duration;

/// The subset of [`crate::server::config::ServerConfig`] the scheduler and
/// its worker loop need, collected so `Scheduler::spawn` doesn't have to
/// take the whole config struct.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    pub collection_window: Duration,
    pub idle_sleep: Duration,
    pub rate_window_samples: usize,
}

impl From<&crate::server::config::ServerConfig> for SchedulerConfig {
    fn from(config: &crate::server::config::ServerConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            collection_window: Duration::from_millis(config.collection_window_ms),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
            rate_window_samples: config.rate_window_samples,
        }
    }
}
