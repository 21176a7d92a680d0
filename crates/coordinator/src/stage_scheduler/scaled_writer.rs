use super::{BlockedReason, ScheduleResult, StageScheduler};
use crate::error::Result;
use crate::node::{InternalNode, NodeSelector};
use crate::split::SplitAssignments;
use crate::stage_execution::StageExecution;
use crate::task::TaskStatus;
use crate::unblock;
use igloo_common::{ErrorCode, ExecutionFailure};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type TaskStatusProvider = Box<dyn Fn() -> Vec<TaskStatus> + Send>;

/// Adds writer tasks while the upstream stages are producing faster than
/// the current writers can absorb.
pub struct ScaledWriterScheduler {
    stage_execution: Arc<StageExecution>,
    source_tasks: TaskStatusProvider,
    writer_tasks: TaskStatusProvider,
    node_selector: Arc<dyn NodeSelector>,
    writer_min_size_bytes: u64,
    recheck_interval: Duration,
    scheduled_nodes: HashSet<InternalNode>,
    done: Arc<AtomicBool>,
}

impl ScaledWriterScheduler {
    pub fn new(
        stage_execution: Arc<StageExecution>,
        source_tasks: TaskStatusProvider,
        writer_tasks: TaskStatusProvider,
        node_selector: Arc<dyn NodeSelector>,
        writer_min_size_bytes: u64,
        recheck_interval: Duration,
    ) -> Self {
        Self {
            stage_execution,
            source_tasks,
            writer_tasks,
            node_selector,
            writer_min_size_bytes,
            recheck_interval,
            scheduled_nodes: HashSet::new(),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the returned flag ends scaling; the next scheduling step
    /// reports the stage as finished.
    pub fn finish_flag(&self) -> Arc<AtomicBool> {
        self.done.clone()
    }

    fn new_task_count(&self) -> usize {
        if self.scheduled_nodes.is_empty() {
            return 1;
        }

        let running_source_tasks: Vec<TaskStatus> = (self.source_tasks)()
            .into_iter()
            .filter(|status| !status.state.is_done())
            .collect();
        let full_tasks = running_source_tasks
            .iter()
            .filter(|status| status.output_buffer_overutilized)
            .count();
        let full_tasks_ratio = if running_source_tasks.is_empty() {
            0.0
        } else {
            full_tasks as f64 / running_source_tasks.len() as f64
        };

        let written_bytes: u64 = (self.writer_tasks)()
            .iter()
            .map(|status| status.physical_written_bytes)
            .sum();
        let min_written_bytes = self.writer_min_size_bytes * self.scheduled_nodes.len() as u64;

        if full_tasks_ratio >= 0.5 && written_bytes >= min_written_bytes {
            1
        } else {
            0
        }
    }

    fn schedule_tasks(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let nodes = self.node_selector.select_random_nodes(count, &self.scheduled_nodes);
        if self.scheduled_nodes.is_empty() && nodes.is_empty() {
            return Err(ExecutionFailure::new(ErrorCode::NO_NODES_AVAILABLE, "No nodes available to run query").into());
        }
        for node in nodes {
            let partition = self.scheduled_nodes.len() as u32;
            if self
                .stage_execution
                .schedule_task(&node, partition, SplitAssignments::new())?
                .is_some()
            {
                self.scheduled_nodes.insert(node);
            }
        }
        Ok(())
    }
}

impl StageScheduler for ScaledWriterScheduler {
    fn schedule(&mut self) -> Result<ScheduleResult> {
        let count = self.new_task_count();
        self.schedule_tasks(count)?;
        Ok(ScheduleResult::blocked(
            self.done.load(Ordering::SeqCst),
            unblock::delay(self.recheck_interval),
            BlockedReason::WriterScaling,
            0,
        ))
    }
}
