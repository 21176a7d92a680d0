//! The collaborators a query scheduler talks to. They are shared by every
//! query on the coordinator.

use crate::dynamic_filters::DynamicFilterService;
use crate::exchange::ExchangeManager;
use crate::execution_schedule::ExecutionPolicy;
use crate::fault_tolerant::{
    NodeAllocatorService, PartitionMemoryEstimatorFactory, TaskDescriptorStorage, TaskSourceFactory,
};
use crate::node::{FailureDetector, NodePartitioningManager, NodeScheduler};
use crate::split::SplitSourceFactory;
use crate::stats::SplitSchedulerStats;
use crate::task::{CoordinatorTaskManager, RemoteTaskFactory};
use std::sync::Arc;

#[derive(Clone)]
pub struct SchedulerServices {
    pub node_scheduler: Arc<dyn NodeScheduler>,
    pub node_partitioning_manager: Arc<dyn NodePartitioningManager>,
    pub node_allocator_service: Arc<dyn NodeAllocatorService>,
    pub partition_memory_estimator_factory: Arc<dyn PartitionMemoryEstimatorFactory>,
    pub remote_task_factory: Arc<dyn RemoteTaskFactory>,
    pub failure_detector: Arc<dyn FailureDetector>,
    pub execution_policy: Arc<dyn ExecutionPolicy>,
    pub dynamic_filter_service: Arc<dyn DynamicFilterService>,
    pub split_source_factory: Arc<dyn SplitSourceFactory>,
    pub coordinator_task_manager: Arc<dyn CoordinatorTaskManager>,
    /// Required by the `task` retry policy only.
    pub exchange_manager: Option<Arc<dyn ExchangeManager>>,
    pub task_source_factory: Arc<dyn TaskSourceFactory>,
    pub task_descriptor_storage: Arc<TaskDescriptorStorage>,
    pub scheduler_stats: Arc<SplitSchedulerStats>,
}
