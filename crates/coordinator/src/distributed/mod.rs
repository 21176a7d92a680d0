//! Schedulers for the stages that run on workers.
//!
//! One distributed scheduler exists per query attempt. The query scheduler
//! keeps the live one in a [`DistributedSchedulerSlot`] and replaces it
//! wholesale when the query is retried.

mod fault_tolerant;
mod pipelined;

pub use fault_tolerant::FaultTolerantDistributedStagesScheduler;
pub use pipelined::PipelinedDistributedStagesScheduler;

use crate::error::Result;
use crate::stage_execution::StageExecution;
use crate::state_machine::{State, StateMachine};
use igloo_common::{ExecutionFailure, QueryId, StageId, TaskId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributedStagesSchedulerState {
    Planned,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl DistributedStagesSchedulerState {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Planned | Self::Running)
    }

    /// A terminal state other than success or cancellation.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Aborted | Self::Failed)
    }
}

impl State for DistributedStagesSchedulerState {
    fn is_done(&self) -> bool {
        DistributedStagesSchedulerState::is_done(self)
    }
}

/// Why a distributed scheduler failed and, when known, which stage caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailureInfo {
    pub failure: ExecutionFailure,
    pub failed_stage_id: Option<StageId>,
}

pub struct DistributedStagesSchedulerStateMachine {
    query_id: QueryId,
    state: StateMachine<DistributedStagesSchedulerState>,
    failure: Mutex<Option<StageFailureInfo>>,
}

impl DistributedStagesSchedulerStateMachine {
    pub fn new(query_id: QueryId, executor: Handle) -> Self {
        let state = StateMachine::new(
            format!("distributed stages scheduler {}", query_id),
            executor,
            DistributedStagesSchedulerState::Planned,
        );
        Self {
            query_id,
            state,
            failure: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DistributedStagesSchedulerState {
        self.state.get()
    }

    pub fn transition_to_running(&self) -> bool {
        self.state.set(DistributedStagesSchedulerState::Running)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.state.set(DistributedStagesSchedulerState::Finished)
    }

    pub fn transition_to_canceled(&self) -> bool {
        self.state.set(DistributedStagesSchedulerState::Canceled)
    }

    pub fn transition_to_aborted(&self) -> bool {
        self.state.set(DistributedStagesSchedulerState::Aborted)
    }

    /// Records the first failure only; later failures are logged and dropped.
    pub fn transition_to_failed(&self, failure: ExecutionFailure, failed_stage_id: Option<StageId>) -> bool {
        {
            let mut current = self.failure.lock();
            if current.is_none() && !self.state().is_done() {
                *current = Some(StageFailureInfo {
                    failure: failure.clone(),
                    failed_stage_id,
                });
            }
        }
        let failed = self.state.set(DistributedStagesSchedulerState::Failed);
        if failed {
            error!(query_id = %self.query_id, "Failure in distributed stage: {}", failure);
        } else {
            debug!(query_id = %self.query_id, "Failure in distributed stage after finished: {}", failure);
        }
        failed
    }

    pub fn failure_info(&self) -> Option<StageFailureInfo> {
        self.failure.lock().clone()
    }

    /// Listeners run on the notification executor and may observe
    /// transitions out of order.
    pub fn add_state_change_listener(&self, listener: impl Fn(DistributedStagesSchedulerState) + Send + Sync + 'static) {
        self.state.add_listener(listener);
    }
}

/// The two scheduling strategies, chosen once per query from its retry policy.
#[derive(Clone)]
pub enum DistributedStagesScheduler {
    Pipelined(Arc<PipelinedDistributedStagesScheduler>),
    FaultTolerant(Arc<FaultTolerantDistributedStagesScheduler>),
}

impl DistributedStagesScheduler {
    /// Drives scheduling until every task is placed or the scheduler is
    /// done. Runs at most once per instance.
    pub async fn schedule(&self) {
        match self {
            Self::Pipelined(scheduler) => scheduler.schedule().await,
            Self::FaultTolerant(scheduler) => scheduler.schedule().await,
        }
    }

    pub fn cancel_stage(&self, stage_id: &StageId) -> Result<()> {
        match self {
            Self::Pipelined(scheduler) => {
                scheduler.cancel_stage(stage_id);
                Ok(())
            }
            Self::FaultTolerant(scheduler) => scheduler.cancel_stage(stage_id),
        }
    }

    pub fn cancel(&self) {
        match self {
            Self::Pipelined(scheduler) => scheduler.cancel(),
            Self::FaultTolerant(scheduler) => scheduler.cancel(),
        }
    }

    pub fn abort(&self) {
        match self {
            Self::Pipelined(scheduler) => scheduler.abort(),
            Self::FaultTolerant(scheduler) => scheduler.abort(),
        }
    }

    pub fn report_task_failure(&self, task_id: &TaskId, failure: ExecutionFailure) -> Result<()> {
        match self {
            Self::Pipelined(scheduler) => {
                scheduler.report_task_failure(task_id, failure);
                Ok(())
            }
            Self::FaultTolerant(scheduler) => scheduler.report_task_failure(task_id, failure),
        }
    }

    pub fn state(&self) -> DistributedStagesSchedulerState {
        self.state_machine().state()
    }

    pub fn failure_info(&self) -> Option<StageFailureInfo> {
        self.state_machine().failure_info()
    }

    /// The execution of `stage_id` in this attempt. Fault tolerant
    /// scheduling runs tasks without stage executions.
    pub fn stage_execution(&self, stage_id: &StageId) -> Option<Arc<StageExecution>> {
        match self {
            Self::Pipelined(scheduler) => scheduler.stage_execution(stage_id).cloned(),
            Self::FaultTolerant(_) => None,
        }
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(DistributedStagesSchedulerState) + Send + Sync + 'static) {
        self.state_machine().add_state_change_listener(listener);
    }

    fn state_machine(&self) -> &DistributedStagesSchedulerStateMachine {
        match self {
            Self::Pipelined(scheduler) => scheduler.state_machine(),
            Self::FaultTolerant(scheduler) => scheduler.state_machine(),
        }
    }
}

/// Holds the live distributed scheduler. Empty until the first attempt is
/// created; every replacement bumps the generation.
#[derive(Default)]
pub struct DistributedSchedulerSlot {
    current: Mutex<Option<DistributedStagesScheduler>>,
    generation: AtomicU64,
}

impl DistributedSchedulerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<DistributedStagesScheduler> {
        self.current.lock().clone()
    }

    /// Installs `scheduler` and returns the one it replaces.
    pub fn replace(&self, scheduler: DistributedStagesScheduler) -> Option<DistributedStagesScheduler> {
        let mut current = self.current.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        current.replace(scheduler)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use igloo_common::ErrorCode;

    #[tokio::test]
    async fn test_first_failure_wins() {
        let state_machine = DistributedStagesSchedulerStateMachine::new(QueryId::new("q"), Handle::current());
        let stage_id = StageId::new(QueryId::new("q"), 1);
        assert!(state_machine.transition_to_running());
        assert!(state_machine.transition_to_failed(
            ExecutionFailure::new(ErrorCode::GENERIC_USER_ERROR, "first"),
            Some(stage_id.clone())
        ));
        assert!(!state_machine.transition_to_failed(ExecutionFailure::internal("second"), None));
        assert!(!state_machine.transition_to_finished());

        let info = state_machine.failure_info().unwrap();
        assert_eq!(info.failure.message(), "first");
        assert_eq!(info.failed_stage_id, Some(stage_id));
        assert_eq!(state_machine.state(), DistributedStagesSchedulerState::Failed);
    }

    #[test]
    fn test_state_classification() {
        assert!(!DistributedStagesSchedulerState::Running.is_done());
        assert!(DistributedStagesSchedulerState::Canceled.is_done());
        assert!(!DistributedStagesSchedulerState::Canceled.is_failure());
        assert!(DistributedStagesSchedulerState::Aborted.is_failure());
    }
}
