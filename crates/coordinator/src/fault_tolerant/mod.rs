//! Building blocks of fault tolerant execution: stage output is spooled into
//! exchanges and every task partition can be re-run on its own.

mod memory;
mod node_allocator;
mod partitioning;
mod stage_scheduler;
mod task_source;

pub use memory::{
    ExponentialGrowthPartitionMemoryEstimator, ExponentialGrowthPartitionMemoryEstimatorFactory,
    PartitionMemoryEstimator, PartitionMemoryEstimatorFactory,
};
pub use node_allocator::{MemoryRequirements, NodeAllocator, NodeAllocatorService, NodeLease, NodeRequirements};
pub use partitioning::{BucketToPartition, BucketToPartitionCache};
pub use stage_scheduler::{FaultTolerantSchedulingContext, FaultTolerantStageScheduler, RetryBudget};
pub use task_source::{TaskDescriptor, TaskDescriptorStorage, TaskDescriptorsFuture, TaskSource, TaskSourceFactory};
