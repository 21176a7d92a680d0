//! Per-stage task and split placement for pipelined execution.

mod fixed_count;
mod fixed_source_partitioned;
mod scaled_writer;
mod source_partitioned;

pub use fixed_count::FixedCountScheduler;
pub use fixed_source_partitioned::FixedSourcePartitionedScheduler;
pub use scaled_writer::{ScaledWriterScheduler, TaskStatusProvider};
pub use source_partitioned::{SourcePartitionedScheduler, SourceTasksBlocked};

use crate::error::Result;
use crate::node::{BucketNodeMap, InternalNode, NodeSelector, SplitPlacementResult};
use crate::split::Split;
use crate::stage_execution::StageExecution;
use crate::unblock::{self, UnblockFuture};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    WriterScaling,
    WaitingForSource,
    SplitQueuesFull,
}

/// Outcome of one bounded unit of scheduling work.
pub struct ScheduleResult {
    finished: bool,
    blocked: UnblockFuture,
    blocked_reason: Option<BlockedReason>,
    splits_scheduled: usize,
}

impl ScheduleResult {
    pub fn finished(splits_scheduled: usize) -> Self {
        Self::non_blocked(true, splits_scheduled)
    }

    pub fn non_blocked(finished: bool, splits_scheduled: usize) -> Self {
        Self {
            finished,
            blocked: unblock::immediate(),
            blocked_reason: None,
            splits_scheduled,
        }
    }

    pub fn blocked(
        finished: bool,
        blocked: UnblockFuture,
        blocked_reason: BlockedReason,
        splits_scheduled: usize,
    ) -> Self {
        Self {
            finished,
            blocked,
            blocked_reason: Some(blocked_reason),
            splits_scheduled,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn blocked_future(&self) -> &UnblockFuture {
        &self.blocked
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        self.blocked_reason
    }

    pub fn splits_scheduled(&self) -> usize {
        self.splits_scheduled
    }
}

pub trait StageScheduler: Send {
    fn start(&mut self) {}

    fn schedule(&mut self) -> Result<ScheduleResult>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Decides which node each split goes to.
pub trait SplitPlacementPolicy: Send {
    fn compute_assignments(&self, splits: Vec<Split>) -> SplitPlacementResult;
}

/// Places splits on the least loaded eligible nodes.
pub struct DynamicSplitPlacementPolicy {
    node_selector: Arc<dyn NodeSelector>,
    stage_execution: Arc<StageExecution>,
}

impl DynamicSplitPlacementPolicy {
    pub fn new(node_selector: Arc<dyn NodeSelector>, stage_execution: Arc<StageExecution>) -> Self {
        Self {
            node_selector,
            stage_execution,
        }
    }
}

impl SplitPlacementPolicy for DynamicSplitPlacementPolicy {
    fn compute_assignments(&self, splits: Vec<Split>) -> SplitPlacementResult {
        self.node_selector
            .compute_assignments(splits, &self.stage_execution.all_tasks())
    }
}

/// Places splits on the node owning their bucket.
pub struct BucketedSplitPlacementPolicy {
    bucket_node_map: BucketNodeMap,
}

impl BucketedSplitPlacementPolicy {
    pub fn new(bucket_node_map: BucketNodeMap) -> Self {
        Self { bucket_node_map }
    }
}

const UNASSIGNED_SPLIT_RETRY_DELAY: Duration = Duration::from_millis(100);

impl SplitPlacementPolicy for BucketedSplitPlacementPolicy {
    fn compute_assignments(&self, splits: Vec<Split>) -> SplitPlacementResult {
        let mut assignments: Vec<(InternalNode, Vec<Split>)> = Vec::new();
        let mut unassigned = Vec::new();
        for split in splits {
            let node = self
                .bucket_node_map
                .bucket_for_split(&split)
                .and_then(|bucket| self.bucket_node_map.assigned_node(bucket));
            match node {
                Some(node) => match assignments.iter_mut().find(|(assigned, _)| assigned == node) {
                    Some((_, node_splits)) => node_splits.push(split),
                    None => assignments.push((node.clone(), vec![split])),
                },
                None => unassigned.push(split),
            }
        }
        let blocked = if unassigned.is_empty() {
            unblock::immediate()
        } else {
            unblock::delay(UNASSIGNED_SPLIT_RETRY_DELAY)
        };
        SplitPlacementResult {
            assignments,
            unassigned,
            blocked,
        }
    }
}
