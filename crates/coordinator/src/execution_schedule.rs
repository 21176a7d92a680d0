//! Decides which stages the pipelined scheduling loop works on.

use crate::stage_execution::StageExecution;
use crate::unblock::UnblockFuture;
use std::sync::Arc;

pub struct StagesScheduleResult {
    pub stages_to_schedule: Vec<Arc<StageExecution>>,
    /// Resolves when the schedule may return a different set of stages.
    pub reschedule: Option<UnblockFuture>,
}

pub trait ExecutionSchedule: Send {
    fn stages_to_schedule(&mut self) -> StagesScheduleResult;

    fn is_finished(&self) -> bool;
}

pub trait ExecutionPolicy: Send + Sync {
    /// `stages` are in topological order, parents first.
    fn create_execution_schedule(&self, stages: Vec<Arc<StageExecution>>) -> Box<dyn ExecutionSchedule>;
}

/// Schedules every stage at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllAtOnceExecutionPolicy;

impl ExecutionPolicy for AllAtOnceExecutionPolicy {
    fn create_execution_schedule(&self, stages: Vec<Arc<StageExecution>>) -> Box<dyn ExecutionSchedule> {
        Box::new(AllAtOnceExecutionSchedule { stages })
    }
}

struct AllAtOnceExecutionSchedule {
    stages: Vec<Arc<StageExecution>>,
}

impl ExecutionSchedule for AllAtOnceExecutionSchedule {
    fn stages_to_schedule(&mut self) -> StagesScheduleResult {
        self.stages.retain(|stage| stage.state().can_schedule_more_tasks());
        StagesScheduleResult {
            stages_to_schedule: self.stages.clone(),
            reschedule: None,
        }
    }

    fn is_finished(&self) -> bool {
        self.stages.iter().all(|stage| !stage.state().can_schedule_more_tasks())
    }
}
