use std::time::Duration;

pub const DEFAULT_MIN_WORKERS: u64 = 1;
pub const DEFAULT_REGISTER_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_PARTITIONS_PER_WORKER: u64 = 1;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_STEPS: u64 = 0;

/// Per-job settings held by the master. `max_steps == 0` means unbounded,
/// `checkpoint_interval == 0` disables checkpointing, and `start_step > 0`
/// selects the restart-from-checkpoint path.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_id: String,
    pub min_workers: u64,
    pub register_wait: Duration,
    pub min_partitions_per_worker: u64,
    pub heartbeat_interval: Duration,
    pub max_steps: u64,
    pub start_step: u64,
    pub checkpoint_interval: u64,
    pub load_paths: Vec<String>,
}

impl JobConfig {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            min_workers: DEFAULT_MIN_WORKERS,
            register_wait: DEFAULT_REGISTER_WAIT,
            min_partitions_per_worker: DEFAULT_MIN_PARTITIONS_PER_WORKER,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_steps: DEFAULT_MAX_STEPS,
            start_step: 0,
            checkpoint_interval: 0,
            load_paths: Vec::new(),
        }
    }
}
