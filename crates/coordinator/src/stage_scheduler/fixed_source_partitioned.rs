use super::{BucketedSplitPlacementPolicy, ScheduleResult, SourcePartitionedScheduler, StageScheduler};
use crate::error::{combine_failures, CoordinatorError, Result};
use crate::node::{BucketNodeMap, InternalNode};
use crate::split::{SplitAssignments, SplitSource};
use crate::stage_execution::StageExecution;
use igloo_common::PlanNodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Runs a fixed set of tasks, one per node, and feeds each table scan of
/// the stage in turn, routing splits by bucket.
pub struct FixedSourcePartitionedScheduler {
    stage_execution: Arc<StageExecution>,
    nodes: Vec<InternalNode>,
    source_schedulers: Vec<SourcePartitionedScheduler>,
    current_source: usize,
    tasks_scheduled: bool,
}

impl FixedSourcePartitionedScheduler {
    pub fn new(
        stage_execution: Arc<StageExecution>,
        mut split_sources: HashMap<PlanNodeId, Arc<dyn SplitSource>>,
        scheduling_order: &[PlanNodeId],
        nodes: Vec<InternalNode>,
        bucket_node_map: BucketNodeMap,
        split_batch_size: usize,
    ) -> Result<Self> {
        let mut source_schedulers = Vec::with_capacity(scheduling_order.len());
        for plan_node_id in scheduling_order {
            let split_source = split_sources.remove(plan_node_id).ok_or_else(|| {
                CoordinatorError::Internal(format!("No split source for partitioned source {}", plan_node_id))
            })?;
            source_schedulers.push(SourcePartitionedScheduler::for_existing_tasks(
                stage_execution.clone(),
                plan_node_id.clone(),
                split_source,
                Box::new(BucketedSplitPlacementPolicy::new(bucket_node_map.clone())),
                split_batch_size,
            ));
        }
        Ok(Self {
            stage_execution,
            nodes,
            source_schedulers,
            current_source: 0,
            tasks_scheduled: false,
        })
    }
}

impl StageScheduler for FixedSourcePartitionedScheduler {
    fn schedule(&mut self) -> Result<ScheduleResult> {
        if !self.tasks_scheduled {
            self.tasks_scheduled = true;
            for (partition, node) in self.nodes.iter().enumerate() {
                self.stage_execution
                    .schedule_task(node, partition as u32, SplitAssignments::new())?;
            }
        }

        let mut splits_scheduled = 0;
        while let Some(scheduler) = self.source_schedulers.get_mut(self.current_source) {
            let result = scheduler.schedule()?;
            splits_scheduled += result.splits_scheduled();
            if !result.is_finished() {
                return Ok(match result.blocked_reason() {
                    Some(reason) => {
                        ScheduleResult::blocked(false, result.blocked_future().clone(), reason, splits_scheduled)
                    }
                    None => ScheduleResult::non_blocked(false, splits_scheduled),
                });
            }
            self.current_source += 1;
        }
        Ok(ScheduleResult::finished(splits_scheduled))
    }

    fn close(&mut self) -> Result<()> {
        let errors = self
            .source_schedulers
            .iter_mut()
            .filter_map(|scheduler| scheduler.close().err())
            .collect();
        combine_failures(errors)
    }
}
