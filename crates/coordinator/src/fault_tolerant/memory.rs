use super::node_allocator::MemoryRequirements;
use crate::query::Session;
use igloo_common::ErrorCode;

/// Sizes the memory reservation of each attempt of a task partition.
pub trait PartitionMemoryEstimator: Send + Sync {
    fn initial_memory_requirements(&self, session: &Session, default_bytes: u64) -> MemoryRequirements;

    fn next_memory_requirements_after_failure(
        &self,
        previous: MemoryRequirements,
        peak_usage_bytes: u64,
        error_code: Option<ErrorCode>,
    ) -> MemoryRequirements;

    fn register_partition_finished(
        &self,
        _requirements: MemoryRequirements,
        _peak_usage_bytes: u64,
        _success: bool,
        _error_code: Option<ErrorCode>,
    ) {
    }
}

pub trait PartitionMemoryEstimatorFactory: Send + Sync {
    fn create_partition_memory_estimator(&self) -> Box<dyn PartitionMemoryEstimator>;
}

/// Grows the reservation geometrically after out of memory failures, up to
/// a cap, and otherwise keeps the larger of the previous reservation and the
/// observed peak.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialGrowthPartitionMemoryEstimator {
    growth_factor: f64,
    max_bytes: u64,
}

impl ExponentialGrowthPartitionMemoryEstimator {
    pub fn new(growth_factor: f64, max_bytes: u64) -> Self {
        Self {
            growth_factor,
            max_bytes,
        }
    }

    fn grow(&self, bytes: u64) -> u64 {
        (bytes as f64 * self.growth_factor) as u64
    }
}

impl PartitionMemoryEstimator for ExponentialGrowthPartitionMemoryEstimator {
    fn initial_memory_requirements(&self, session: &Session, default_bytes: u64) -> MemoryRequirements {
        let initial = session.settings().initial_task_memory_bytes.max(default_bytes);
        MemoryRequirements::new(initial.min(self.max_bytes))
    }

    fn next_memory_requirements_after_failure(
        &self,
        previous: MemoryRequirements,
        peak_usage_bytes: u64,
        error_code: Option<ErrorCode>,
    ) -> MemoryRequirements {
        let out_of_memory = error_code.map(|code| code.is_out_of_memory()).unwrap_or(false);
        let next = if out_of_memory {
            self.grow(previous.required_bytes).max(self.grow(peak_usage_bytes))
        } else {
            previous.required_bytes.max(peak_usage_bytes)
        };
        MemoryRequirements::new(next.min(self.max_bytes))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExponentialGrowthPartitionMemoryEstimatorFactory {
    growth_factor: f64,
    max_bytes: u64,
}

impl ExponentialGrowthPartitionMemoryEstimatorFactory {
    pub fn new(growth_factor: f64, max_bytes: u64) -> Self {
        Self {
            growth_factor,
            max_bytes,
        }
    }
}

impl PartitionMemoryEstimatorFactory for ExponentialGrowthPartitionMemoryEstimatorFactory {
    fn create_partition_memory_estimator(&self) -> Box<dyn PartitionMemoryEstimator> {
        Box::new(ExponentialGrowthPartitionMemoryEstimator::new(
            self.growth_factor,
            self.max_bytes,
        ))
    }
}
