use super::{BlockedReason, ScheduleResult, SplitPlacementPolicy, StageScheduler};
use crate::error::{CoordinatorError, Result};
use crate::node::{InternalNode, NodeSelector};
use crate::split::{FetchResult, Split, SplitAssignments, SplitBatchFetcher, SplitSource};
use crate::stage_execution::StageExecution;
use crate::unblock;
use igloo_common::{ErrorCode, ExecutionFailure, PlanNodeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reports whether any task of the stages feeding this one has a full
/// output buffer.
pub type SourceTasksBlocked = Box<dyn Fn() -> bool + Send>;

const SOURCE_TASKS_BLOCKED_RECHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Running,
    Finished,
}

/// Streams the splits of one table scan onto the tasks of a stage.
///
/// With a dynamic placement policy tasks are created on demand on the nodes
/// that receive splits. With a bucketed policy the tasks are created up
/// front by the owning scheduler and splits are only routed to them.
pub struct SourcePartitionedScheduler {
    stage_execution: Arc<StageExecution>,
    partitioned_node: PlanNodeId,
    fetcher: SplitBatchFetcher,
    placement_policy: Box<dyn SplitPlacementPolicy>,
    task_creation: Option<Arc<dyn NodeSelector>>,
    pending_splits: Vec<Split>,
    next_partition: u32,
    state: SourceState,
    any_source_task_blocked: Option<SourceTasksBlocked>,
}

impl SourcePartitionedScheduler {
    /// Creates tasks as splits are placed; `node_selector` picks a node for
    /// the single task of a scan without any split.
    pub fn with_task_creation(
        stage_execution: Arc<StageExecution>,
        partitioned_node: PlanNodeId,
        split_source: Arc<dyn SplitSource>,
        placement_policy: Box<dyn SplitPlacementPolicy>,
        node_selector: Arc<dyn NodeSelector>,
        split_batch_size: usize,
    ) -> Self {
        Self::new(
            stage_execution,
            partitioned_node,
            split_source,
            placement_policy,
            Some(node_selector),
            split_batch_size,
        )
    }

    /// Routes splits to tasks that already exist.
    pub fn for_existing_tasks(
        stage_execution: Arc<StageExecution>,
        partitioned_node: PlanNodeId,
        split_source: Arc<dyn SplitSource>,
        placement_policy: Box<dyn SplitPlacementPolicy>,
        split_batch_size: usize,
    ) -> Self {
        Self::new(
            stage_execution,
            partitioned_node,
            split_source,
            placement_policy,
            None,
            split_batch_size,
        )
    }

    fn new(
        stage_execution: Arc<StageExecution>,
        partitioned_node: PlanNodeId,
        split_source: Arc<dyn SplitSource>,
        placement_policy: Box<dyn SplitPlacementPolicy>,
        task_creation: Option<Arc<dyn NodeSelector>>,
        split_batch_size: usize,
    ) -> Self {
        Self {
            stage_execution,
            partitioned_node,
            fetcher: SplitBatchFetcher::new(split_source, split_batch_size),
            placement_policy,
            task_creation,
            pending_splits: Vec::new(),
            next_partition: 0,
            state: SourceState::Running,
            any_source_task_blocked: None,
        }
    }

    /// Holds back new splits while `any_source_task_blocked` reports true.
    pub fn with_source_task_backpressure(mut self, any_source_task_blocked: SourceTasksBlocked) -> Self {
        self.any_source_task_blocked = Some(any_source_task_blocked);
        self
    }

    fn source_tasks_blocked(&self) -> bool {
        // tasks already running keep draining the source stages
        !self.stage_execution.all_tasks().is_empty()
            && self
                .any_source_task_blocked
                .as_ref()
                .is_some_and(|blocked| blocked())
    }

    pub fn partitioned_node(&self) -> &PlanNodeId {
        &self.partitioned_node
    }

    fn assign_splits(&mut self, assignments: Vec<(InternalNode, Vec<Split>)>) -> Result<usize> {
        let mut assigned = 0;
        for (node, splits) in assignments {
            assigned += splits.len();
            let existing = self
                .stage_execution
                .all_tasks()
                .into_iter()
                .find(|task| task.node() == &node);
            let mut assignment = SplitAssignments::new();
            assignment.insert(self.partitioned_node.clone(), splits);
            match existing {
                Some(task) => task.add_splits(assignment),
                None if self.task_creation.is_some() => {
                    let partition = self.next_partition;
                    self.next_partition += 1;
                    if self.stage_execution.schedule_task(&node, partition, assignment)?.is_none() {
                        debug!("Stage {} is done, dropping splits for {}", self.stage_execution.stage_id(), node);
                    }
                }
                None => {
                    return Err(CoordinatorError::Internal(format!(
                        "No task of stage {} runs on node {}",
                        self.stage_execution.stage_id(),
                        node
                    )))
                }
            }
        }
        Ok(assigned)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(node_selector) = &self.task_creation {
            if self.stage_execution.all_tasks().is_empty() {
                // a scan without splits still needs one task to produce its (empty) output
                let node = node_selector
                    .select_random_nodes(1, &HashSet::new())
                    .into_iter()
                    .next()
                    .ok_or_else(|| ExecutionFailure::new(ErrorCode::NO_NODES_AVAILABLE, "No nodes available to run query"))?;
                let partition = self.next_partition;
                self.next_partition += 1;
                self.stage_execution
                    .schedule_task(&node, partition, SplitAssignments::new())?;
            }
        }
        self.stage_execution.no_more_splits(&self.partitioned_node);
        self.state = SourceState::Finished;
        Ok(())
    }
}

impl StageScheduler for SourcePartitionedScheduler {
    fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.state == SourceState::Finished {
            return Ok(ScheduleResult::finished(0));
        }
        if self.source_tasks_blocked() {
            return Ok(ScheduleResult::blocked(
                false,
                unblock::delay(SOURCE_TASKS_BLOCKED_RECHECK),
                BlockedReason::SplitQueuesFull,
                0,
            ));
        }

        if self.pending_splits.is_empty() {
            match self.fetcher.fetch()? {
                FetchResult::Blocked(blocked) => {
                    return Ok(ScheduleResult::blocked(false, blocked, BlockedReason::WaitingForSource, 0))
                }
                FetchResult::Splits(splits) => self.pending_splits = splits,
                FetchResult::Exhausted => {
                    self.finish()?;
                    return Ok(ScheduleResult::finished(0));
                }
            }
        }
        if self.pending_splits.is_empty() {
            return Ok(ScheduleResult::non_blocked(false, 0));
        }

        let placement = self
            .placement_policy
            .compute_assignments(std::mem::take(&mut self.pending_splits));
        let splits_scheduled = self.assign_splits(placement.assignments)?;
        if !placement.unassigned.is_empty() {
            self.pending_splits = placement.unassigned;
            return Ok(ScheduleResult::blocked(
                false,
                placement.blocked,
                BlockedReason::SplitQueuesFull,
                splits_scheduled,
            ));
        }
        Ok(ScheduleResult::non_blocked(false, splits_scheduled))
    }

    fn close(&mut self) -> Result<()> {
        self.fetcher.source().close()
    }
}
