use super::{ScheduleResult, StageScheduler};
use crate::error::Result;
use crate::node::InternalNode;
use crate::split::SplitAssignments;
use crate::stage_execution::StageExecution;
use std::sync::Arc;

/// Creates one task per partition, all in a single scheduling step.
pub struct FixedCountScheduler {
    stage_execution: Arc<StageExecution>,
    partition_to_node: Vec<InternalNode>,
    scheduled: bool,
}

impl FixedCountScheduler {
    pub fn new(stage_execution: Arc<StageExecution>, partition_to_node: Vec<InternalNode>) -> Self {
        Self {
            stage_execution,
            partition_to_node,
            scheduled: false,
        }
    }
}

impl StageScheduler for FixedCountScheduler {
    fn schedule(&mut self) -> Result<ScheduleResult> {
        if !self.scheduled {
            self.scheduled = true;
            for (partition, node) in self.partition_to_node.iter().enumerate() {
                self.stage_execution
                    .schedule_task(node, partition as u32, SplitAssignments::new())?;
            }
        }
        Ok(ScheduleResult::finished(0))
    }
}
