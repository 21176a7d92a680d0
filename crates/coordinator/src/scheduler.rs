//! The per-query scheduler: runs the coordinator stages once, drives one
//! distributed scheduler per attempt and decides whether a failed attempt is
//! retried.

use crate::config::RetryPolicy;
use crate::coordinator_stages::CoordinatorStagesScheduler;
use crate::distributed::{
    DistributedSchedulerSlot, DistributedStagesScheduler, DistributedStagesSchedulerState,
    FaultTolerantDistributedStagesScheduler, PipelinedDistributedStagesScheduler, StageFailureInfo,
};
use crate::error::{verify, CoordinatorError, Result};
use crate::fragment::SubPlan;
use crate::query::{QueryState, QueryStateMachine};
use crate::services::SchedulerServices;
use crate::stage::{BasicStageStats, StageInfo, StageManager};
use igloo_common::{ErrorCode, ErrorType, ExecutionFailure, StageId, TaskId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on waiting for the previous attempt to stop scheduling.
const PREVIOUS_ATTEMPT_STOP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct Control {
    started: bool,
    scheduling_task: Option<JoinHandle<()>>,
}

pub struct SqlQueryScheduler {
    query_state_machine: Arc<QueryStateMachine>,
    services: SchedulerServices,
    stage_manager: Arc<StageManager>,
    coordinator_stages_scheduler: Arc<CoordinatorStagesScheduler>,
    distributed_scheduler: Arc<DistributedSchedulerSlot>,
    current_attempt: AtomicU32,
    control: Mutex<Control>,
    self_ref: Weak<SqlQueryScheduler>,
}

impl SqlQueryScheduler {
    pub fn new(
        query_state_machine: Arc<QueryStateMachine>,
        plan: &SubPlan,
        services: SchedulerServices,
    ) -> Result<Arc<Self>> {
        let stage_manager = StageManager::create(
            query_state_machine.clone(),
            services.remote_task_factory.clone(),
            plan,
        )?;
        let distributed_scheduler = Arc::new(DistributedSchedulerSlot::new());
        let coordinator_stages_scheduler = CoordinatorStagesScheduler::create(
            query_state_machine.clone(),
            services.node_scheduler.clone(),
            stage_manager.clone(),
            services.failure_detector.clone(),
            distributed_scheduler.clone(),
            services.coordinator_task_manager.clone(),
        )?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            query_state_machine,
            services,
            stage_manager,
            coordinator_stages_scheduler,
            distributed_scheduler,
            current_attempt: AtomicU32::new(0),
            control: Mutex::new(Control::default()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Starts scheduling. Calling it again, or on a query that is already
    /// done, does nothing.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.started {
            return Ok(());
        }
        control.started = true;
        if self.query_state_machine.is_done() {
            return Ok(());
        }

        let scheduler = self.self_ref.clone();
        self.query_state_machine.add_state_change_listener(move |state| {
            if !state.is_done() {
                return;
            }
            let Some(scheduler) = scheduler.upgrade() else {
                return;
            };
            scheduler.on_query_done(state);
        });

        if let Err(error) = self.start_first_attempt(&mut control) {
            let failure = ExecutionFailure::from(error);
            self.query_state_machine.transition_to_failed(failure.clone());
            return Err(failure.into());
        }
        Ok(())
    }

    fn start_first_attempt(&self, control: &mut Control) -> Result<()> {
        let distributed_scheduler = self.create_distributed_stages_scheduler(0)?;
        self.coordinator_stages_scheduler.schedule()?;
        if let Some(distributed_scheduler) = distributed_scheduler {
            control.scheduling_task = Some(
                self.query_state_machine
                    .executor()
                    .spawn(async move { distributed_scheduler.schedule().await }),
            );
        }
        Ok(())
    }

    fn on_query_done(&self, state: QueryState) {
        match state {
            QueryState::Finished => {
                self.coordinator_stages_scheduler.cancel();
                if let Some(scheduler) = self.distributed_scheduler.get() {
                    scheduler.cancel();
                }
                self.stage_manager.finish();
            }
            QueryState::Failed => {
                self.coordinator_stages_scheduler.abort();
                if let Some(scheduler) = self.distributed_scheduler.get() {
                    scheduler.abort();
                }
                self.stage_manager.abort();
            }
            _ => return,
        }
        self.query_state_machine.update_query_info(self.stage_manager.stage_info().ok());
    }

    fn create_distributed_stages_scheduler(&self, attempt: u32) -> Result<Option<DistributedStagesScheduler>> {
        let settings = self.query_state_machine.session().settings();
        verify(attempt == 0 || settings.retry_policy == RetryPolicy::Query, || {
            format!("Unexpected attempt {} for retry policy {:?}", attempt, settings.retry_policy)
        })?;
        if self.query_state_machine.is_done() {
            return Ok(None);
        }

        let scheduler = match settings.retry_policy {
            RetryPolicy::Task => {
                let exchange_manager = self.services.exchange_manager.clone().ok_or_else(|| {
                    ExecutionFailure::new(
                        ErrorCode::EXCHANGE_MANAGER_NOT_CONFIGURED,
                        "Exchange manager must be configured for the fault tolerant execution to work",
                    )
                })?;
                DistributedStagesScheduler::FaultTolerant(FaultTolerantDistributedStagesScheduler::create(
                    &self.query_state_machine,
                    &self.stage_manager,
                    &self.coordinator_stages_scheduler,
                    &self.services,
                    exchange_manager,
                )?)
            }
            RetryPolicy::Query | RetryPolicy::None => {
                if attempt > 0 {
                    self.services
                        .dynamic_filter_service
                        .register_query_retry(self.query_state_machine.query_id(), attempt);
                }
                DistributedStagesScheduler::Pipelined(PipelinedDistributedStagesScheduler::create(
                    &self.query_state_machine,
                    &self.stage_manager,
                    &self.coordinator_stages_scheduler,
                    &self.services,
                    attempt,
                )?)
            }
        };

        self.distributed_scheduler.replace(scheduler.clone());
        let query_scheduler = self.self_ref.clone();
        let observed = scheduler.clone();
        scheduler.add_state_change_listener(move |state| {
            if let Some(query_scheduler) = query_scheduler.upgrade() {
                query_scheduler.on_distributed_state_change(&observed, state);
            }
        });
        Ok(Some(scheduler))
    }

    fn on_distributed_state_change(&self, scheduler: &DistributedStagesScheduler, state: DistributedStagesSchedulerState) {
        let query = &self.query_state_machine;
        if query.state() == QueryState::Starting
            && (state == DistributedStagesSchedulerState::Running || state.is_done())
        {
            query.transition_to_running();
        }

        if state.is_done() && !state.is_failure() {
            for stage in self.stage_manager.distributed_stages_in_topological_order() {
                stage.finish();
            }
        }

        if self.stage_manager.coordinator_stages_in_topological_order().is_empty() {
            match state {
                DistributedStagesSchedulerState::Finished => {
                    query.transition_to_finishing();
                }
                DistributedStagesSchedulerState::Canceled => {
                    query.transition_to_canceled();
                }
                _ => {}
            }
        }

        if state != DistributedStagesSchedulerState::Failed {
            return;
        }
        let failure_info = scheduler.failure_info().unwrap_or_else(|| StageFailureInfo {
            failure: ExecutionFailure::internal("Distributed stages scheduler failed but failure cause is not present"),
            failed_stage_id: None,
        });
        if self.should_retry(failure_info.failure.error_code()) {
            self.schedule_retry_after_delay();
            return;
        }

        for stage in self.stage_manager.distributed_stages_in_topological_order() {
            if failure_info.failed_stage_id.as_ref() == Some(stage.stage_id()) {
                stage.fail(failure_info.failure.clone());
            } else {
                stage.abort();
            }
        }
        query.transition_to_failed(failure_info.failure);
    }

    fn should_retry(&self, error_code: Option<ErrorCode>) -> bool {
        let settings = self.query_state_machine.session().settings();
        settings.retry_policy == RetryPolicy::Query
            && self.current_attempt.load(Ordering::SeqCst) < settings.query_retry_attempts
            && is_retryable(error_code)
    }

    fn schedule_retry_after_delay(&self) {
        let attempt = self.current_attempt.load(Ordering::SeqCst);
        let delay = self.query_state_machine.session().settings().retry_delay(attempt);
        self.current_attempt.fetch_add(1, Ordering::SeqCst);
        info!(
            query_id = %self.query_state_machine.query_id(),
            attempt = attempt + 1,
            "Retrying query after {:?}",
            delay
        );
        let scheduler = self.self_ref.clone();
        self.query_state_machine.executor().spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.schedule_retry().await;
            }
        });
    }

    async fn schedule_retry(&self) {
        if let Err(error) = self.try_schedule_retry().await {
            self.query_state_machine.transition_to_failed(error.into());
        }
    }

    async fn try_schedule_retry(&self) -> Result<()> {
        let previous = self.control.lock().scheduling_task.take().ok_or_else(|| {
            CoordinatorError::Internal("Scheduling task of the previous attempt is not present".to_string())
        })?;
        match tokio::time::timeout(PREVIOUS_ATTEMPT_STOP_TIMEOUT, previous).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(query_id = %self.query_state_machine.query_id(), "Previous attempt ended abnormally: {}", error);
            }
            Err(_) => {
                return Err(CoordinatorError::Internal(
                    "Timed out waiting for the previous attempt to stop scheduling".to_string(),
                ));
            }
        }

        let mut control = self.control.lock();
        let attempt = self.current_attempt.load(Ordering::SeqCst);
        let Some(distributed_scheduler) = self.create_distributed_stages_scheduler(attempt)? else {
            debug!(query_id = %self.query_state_machine.query_id(), "Query is done, attempt {} not started", attempt);
            return Ok(());
        };
        control.scheduling_task = Some(
            self.query_state_machine
                .executor()
                .spawn(async move { distributed_scheduler.schedule().await }),
        );
        Ok(())
    }

    pub fn cancel_stage(&self, stage_id: &StageId) -> Result<()> {
        self.coordinator_stages_scheduler.cancel_stage(stage_id);
        match self.distributed_scheduler.get() {
            Some(scheduler) => scheduler.cancel_stage(stage_id),
            None => Ok(()),
        }
    }

    pub fn fail_task(&self, task_id: &TaskId, cause: ExecutionFailure) -> Result<()> {
        self.stage_manager.fail_task_remotely(task_id, cause)
    }

    pub fn basic_stage_stats(&self) -> BasicStageStats {
        self.stage_manager.basic_stage_stats()
    }

    pub fn stage_info(&self) -> Result<StageInfo> {
        self.stage_manager.stage_info()
    }

    pub fn user_memory_reservation(&self) -> u64 {
        self.stage_manager.user_memory_reservation()
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.stage_manager.total_memory_reservation()
    }

    pub fn total_cpu_time(&self) -> Duration {
        self.stage_manager.total_cpu_time()
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt.load(Ordering::SeqCst)
    }

    pub fn distributed_stages_scheduler(&self) -> Option<DistributedStagesScheduler> {
        self.distributed_scheduler.get()
    }

    pub fn stage_manager(&self) -> &Arc<StageManager> {
        &self.stage_manager
    }

    pub fn query_state_machine(&self) -> &Arc<QueryStateMachine> {
        &self.query_state_machine
    }
}

/// Errors without a code, internal and external errors, and cluster memory
/// exhaustion are worth a new attempt.
fn is_retryable(error_code: Option<ErrorCode>) -> bool {
    match error_code {
        None => true,
        Some(code) => {
            matches!(code.error_type(), ErrorType::InternalError | ErrorType::External)
                || code == ErrorCode::CLUSTER_OUT_OF_MEMORY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_error_codes() {
        assert!(is_retryable(None));
        assert!(is_retryable(Some(ErrorCode::GENERIC_INTERNAL_ERROR)));
        assert!(is_retryable(Some(ErrorCode::REMOTE_HOST_GONE)));
        assert!(is_retryable(Some(ErrorCode::CLUSTER_OUT_OF_MEMORY)));
        assert!(!is_retryable(Some(ErrorCode::EXCEEDED_LOCAL_MEMORY_LIMIT)));
        assert!(!is_retryable(Some(ErrorCode::GENERIC_USER_ERROR)));
    }
}
