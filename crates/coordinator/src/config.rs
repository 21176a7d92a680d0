use crate::error::{CoordinatorError, Result};
use serde::Deserialize;
use std::time::Duration;

/// How failures are recovered from.
///
/// `Query` re-runs every distributed stage from scratch; `Task` re-runs
/// individual task partitions and requires a configured exchange manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    #[default]
    None,
    Query,
    Task,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_query_retry_attempts")]
    pub query_retry_attempts: u32,
    #[serde(default = "default_task_retry_attempts_overall")]
    pub task_retry_attempts_overall: u32,
    #[serde(default = "default_task_retry_attempts_per_task")]
    pub task_retry_attempts_per_task: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_delay_scale_factor")]
    pub retry_delay_scale_factor: f64,
    #[serde(default = "default_max_tasks_waiting_for_node_per_stage")]
    pub max_tasks_waiting_for_node_per_stage: usize,
    #[serde(default = "default_fault_tolerant_execution_partition_count")]
    pub fault_tolerant_execution_partition_count: u32,
    #[serde(default = "default_split_batch_size")]
    pub split_batch_size: usize,
    #[serde(default = "default_writer_min_size_bytes")]
    pub writer_min_size_bytes: u64,
    #[serde(default = "default_scaled_writer_recheck_interval_ms")]
    pub scaled_writer_recheck_interval_ms: u64,
    #[serde(default = "default_initial_task_memory_bytes")]
    pub initial_task_memory_bytes: u64,
    #[serde(default = "default_max_task_memory_bytes")]
    pub max_task_memory_bytes: u64,
}

fn default_query_retry_attempts() -> u32 {
    4
}

fn default_task_retry_attempts_overall() -> u32 {
    i32::MAX as u32
}

fn default_task_retry_attempts_per_task() -> u32 {
    4
}

fn default_retry_initial_delay_ms() -> u64 {
    10_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_retry_delay_scale_factor() -> f64 {
    2.0
}

fn default_max_tasks_waiting_for_node_per_stage() -> usize {
    5
}

fn default_fault_tolerant_execution_partition_count() -> u32 {
    50
}

fn default_split_batch_size() -> usize {
    1000
}

fn default_writer_min_size_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_scaled_writer_recheck_interval_ms() -> u64 {
    200
}

fn default_initial_task_memory_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_max_task_memory_bytes() -> u64 {
    50 * 1024 * 1024 * 1024
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            query_retry_attempts: default_query_retry_attempts(),
            task_retry_attempts_overall: default_task_retry_attempts_overall(),
            task_retry_attempts_per_task: default_task_retry_attempts_per_task(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_delay_scale_factor: default_retry_delay_scale_factor(),
            max_tasks_waiting_for_node_per_stage: default_max_tasks_waiting_for_node_per_stage(),
            fault_tolerant_execution_partition_count: default_fault_tolerant_execution_partition_count(),
            split_batch_size: default_split_batch_size(),
            writer_min_size_bytes: default_writer_min_size_bytes(),
            scaled_writer_recheck_interval_ms: default_scaled_writer_recheck_interval_ms(),
            initial_task_memory_bytes: default_initial_task_memory_bytes(),
            max_task_memory_bytes: default_max_task_memory_bytes(),
        }
    }
}

impl SchedulerSettings {
    /// Loads settings from the file named by `COORDINATOR_CONFIG_PATH`,
    /// overridden by `IGLOO_SCHEDULER__*` environment variables.
    pub fn new() -> Result<Self> {
        let config_file_path = std::env::var("COORDINATOR_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/coordinator/config/default.toml".to_string());

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(true))
            .add_source(config::Environment::with_prefix("IGLOO_SCHEDULER").separator("__"))
            .build()?;
        let settings: SchedulerSettings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let s = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;
        let settings: SchedulerSettings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_delay_scale_factor < 1.0 {
            return Err(CoordinatorError::InvalidConfig(format!(
                "retry_delay_scale_factor must be at least 1.0, got {}",
                self.retry_delay_scale_factor
            )));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(CoordinatorError::InvalidConfig(format!(
                "retry_initial_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_initial_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.max_tasks_waiting_for_node_per_stage == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "max_tasks_waiting_for_node_per_stage must be positive".to_string(),
            ));
        }
        if self.fault_tolerant_execution_partition_count == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "fault_tolerant_execution_partition_count must be positive".to_string(),
            ));
        }
        if self.split_batch_size == 0 {
            return Err(CoordinatorError::InvalidConfig("split_batch_size must be positive".to_string()));
        }
        if self.initial_task_memory_bytes > self.max_task_memory_bytes {
            return Err(CoordinatorError::InvalidConfig(format!(
                "initial_task_memory_bytes ({}) exceeds max_task_memory_bytes ({})",
                self.initial_task_memory_bytes, self.max_task_memory_bytes
            )));
        }
        Ok(())
    }

    /// Delay before query retry number `attempt + 1`:
    /// `min(initial * scale^attempt, max)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.retry_initial_delay_ms as f64 * self.retry_delay_scale_factor.powi(exponent);
        let millis = scaled.min(self.retry_max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn scaled_writer_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.scaled_writer_recheck_interval_ms)
    }
}
