//! Engine and scheduler configuration.

use uuid::Uuid;

/// Tunables for the synchronous engine core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry budget for jobs whose activity has no retry cycle configured.
    pub default_retries: u32,

    /// Backoff applied on failure when no retry cycle is configured. A small
    /// fixed wait keeps a persistently failing job from hot-looping through
    /// the acquisition cycle.
    pub default_retry_backoff: chrono::Duration,

    /// Upper bound on atomic operations per interpreter run. A definition
    /// that loops without reaching a wait state trips this instead of
    /// spinning forever.
    pub max_operations_per_run: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            default_retry_backoff: chrono::Duration::seconds(10),
            max_operations_per_run: 10_000,
        }
    }
}

/// Tunables for the background job scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lock-owner identity written on acquired jobs. Unique per node so an
    /// abandoned lease can be told apart from our own.
    pub lock_owner: String,

    /// Fixed worker pool size.
    pub worker_count: usize,

    /// Maximum jobs acquired per poll cycle.
    pub batch_size: usize,

    /// Sleep between acquisition polls.
    pub poll_interval: std::time::Duration,

    /// Lease length written on acquisition. A lock older than this is
    /// treated as abandoned and becomes re-acquirable.
    pub lock_duration: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("node-{}", Uuid::now_v7().simple()),
            worker_count: 4,
            batch_size: 10,
            poll_interval: std::time::Duration::from_millis(500),
            lock_duration: chrono::Duration::minutes(5),
        }
    }
}
