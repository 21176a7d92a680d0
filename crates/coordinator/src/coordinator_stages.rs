//! Scheduling of the stages pinned to the coordinator.
//!
//! These stages run exactly once per query: their work (a table commit for
//! example) is not safe to repeat, so they are never part of a retry.

use crate::distributed::DistributedSchedulerSlot;
use crate::error::{verify, Result};
use crate::exchange::ExchangeInput;
use crate::node::{FailureDetector, NodeScheduler};
use crate::output_buffers::OutputBufferManager;
use crate::query::{QueryState, QueryStateMachine};
use crate::split::{Split, SplitAssignments};
use crate::stage::StageManager;
use crate::stage_execution::{OutputBufferManagers, StageExecution, StageExecutionState};
use crate::task::{CoordinatorTaskManager, RemoteTask, TaskFailureListener, TaskLifecycleListener};
use igloo_common::{ExecutionFailure, PlanFragmentId, StageId, TaskId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const SINGLE_PARTITION: [u32; 1] = [0];

/// Publishes every task of the output stage as an input of the query result.
struct QueryOutputTaskLifecycleListener {
    query_state_machine: Arc<QueryStateMachine>,
}

impl TaskLifecycleListener for QueryOutputTaskLifecycleListener {
    fn task_created(&self, _fragment_id: PlanFragmentId, task: Arc<dyn RemoteTask>) {
        let status = task.task_status();
        let input = ExchangeInput::Direct {
            task_id: status.task_id.clone(),
            location: status.result_location(0),
        };
        self.query_state_machine.update_inputs_for_query_results(vec![input], false);
    }

    fn no_more_tasks(&self, _fragment_id: PlanFragmentId) {
        self.query_state_machine.update_inputs_for_query_results(Vec::new(), true);
    }
}

/// Forwards failures of tasks feeding the coordinator to the live
/// distributed scheduler.
struct TaskFailureReporter {
    distributed_scheduler: Arc<DistributedSchedulerSlot>,
}

impl TaskFailureListener for TaskFailureReporter {
    fn on_task_failed(&self, task_id: &TaskId, failure: &ExecutionFailure) {
        if failure.is_remote_task_failure() {
            // the upstream task failure is reported by its own stage
            debug!(task_id = %task_id, "Task failure discovered while fetching task results");
            return;
        }
        warn!(task_id = %task_id, "Reported task failure: {}", failure);
        if let Some(scheduler) = self.distributed_scheduler.get() {
            if let Err(error) = scheduler.report_task_failure(task_id, failure.clone()) {
                warn!(task_id = %task_id, "Failed to report task failure: {}", error);
            }
        }
    }
}

pub struct CoordinatorStagesScheduler {
    query_state_machine: Arc<QueryStateMachine>,
    node_scheduler: Arc<dyn NodeScheduler>,
    output_buffer_managers: OutputBufferManagers,
    bucket_to_partition: HashMap<PlanFragmentId, Option<Vec<u32>>>,
    task_lifecycle_listener: Arc<dyn TaskLifecycleListener>,
    stage_manager: Arc<StageManager>,
    stage_executions: Vec<Arc<StageExecution>>,
    distributed_scheduler: Arc<DistributedSchedulerSlot>,
    coordinator_task_manager: Arc<dyn CoordinatorTaskManager>,
    scheduled: Mutex<bool>,
}

impl CoordinatorStagesScheduler {
    pub fn create(
        query_state_machine: Arc<QueryStateMachine>,
        node_scheduler: Arc<dyn NodeScheduler>,
        stage_manager: Arc<StageManager>,
        failure_detector: Arc<dyn FailureDetector>,
        distributed_scheduler: Arc<DistributedSchedulerSlot>,
        coordinator_task_manager: Arc<dyn CoordinatorTaskManager>,
    ) -> Result<Arc<Self>> {
        // the output stage and every stage read by the coordinator produce a single stream
        let mut consumed_by_coordinator = vec![stage_manager.output_stage()?.clone()];
        for coordinator_stage in stage_manager.coordinator_stages_in_topological_order() {
            consumed_by_coordinator.extend(stage_manager.children(coordinator_stage.stage_id()));
        }
        let mut output_buffer_managers = OutputBufferManagers::new();
        let mut bucket_to_partition = HashMap::new();
        for stage in &consumed_by_coordinator {
            let fragment = stage.fragment();
            output_buffer_managers.insert(
                fragment.id,
                Arc::new(OutputBufferManager::single_stream(&fragment.output_partitioning)?),
            );
            bucket_to_partition.insert(fragment.id, Some(SINGLE_PARTITION.to_vec()));
        }

        let shared_managers = Arc::new(output_buffer_managers.clone());
        let mut task_lifecycle_listener: Arc<dyn TaskLifecycleListener> = Arc::new(QueryOutputTaskLifecycleListener {
            query_state_machine: query_state_machine.clone(),
        });
        let mut stage_executions = Vec::new();
        for stage in stage_manager.coordinator_stages_in_topological_order() {
            let execution = StageExecution::create(
                stage.clone(),
                0,
                shared_managers.clone(),
                task_lifecycle_listener.clone(),
                failure_detector.clone(),
                bucket_to_partition.get(&stage.fragment().id).cloned().flatten(),
                query_state_machine.executor().clone(),
            )?;
            task_lifecycle_listener = execution.task_lifecycle_listener();
            stage_executions.push(execution);
        }

        let scheduler = Arc::new(Self {
            query_state_machine,
            node_scheduler,
            output_buffer_managers,
            bucket_to_partition,
            task_lifecycle_listener,
            stage_manager,
            stage_executions,
            distributed_scheduler,
            coordinator_task_manager,
            scheduled: Mutex::new(false),
        });
        scheduler.initialize()?;
        Ok(scheduler)
    }

    fn initialize(&self) -> Result<()> {
        for execution in &self.stage_executions {
            let query = self.query_state_machine.clone();
            let stage = execution.stage().clone();
            let weak_execution = Arc::downgrade(execution);
            execution.add_state_change_listener(move |state| {
                if query.is_done() {
                    return;
                }
                match state {
                    StageExecutionState::Failed => {
                        let cause = weak_execution
                            .upgrade()
                            .and_then(|execution| execution.failure_cause())
                            .unwrap_or_else(|| {
                                ExecutionFailure::internal(format!(
                                    "Stage execution for stage {} failed but failure cause is not present",
                                    stage.stage_id()
                                ))
                            });
                        stage.fail(cause.clone());
                        query.transition_to_failed(cause);
                    }
                    StageExecutionState::Aborted => {
                        // only query cleanup aborts coordinator stages
                        stage.abort();
                        query.transition_to_failed(ExecutionFailure::internal("Query stage was aborted"));
                    }
                    state if state.is_done() => {
                        stage.finish();
                    }
                    _ => {}
                }
            });
        }

        for pair in self.stage_executions.windows(2) {
            let (parent, child) = (&pair[0], pair[1].clone());
            let children = self.stage_manager.children(parent.stage_id());
            verify(children.len() == 1, || {
                format!("Coordinator stage {} must have exactly one child", parent.stage_id())
            })?;
            verify(children[0].stage_id() == child.stage_id(), || {
                format!("Stage execution order does not match the order of stage {}", parent.stage_id())
            })?;
            parent.add_state_change_listener(move |state| {
                if state == StageExecutionState::Flushing || state.is_done() {
                    child.cancel();
                }
            });
        }

        if let Some(root) = self.stage_executions.first() {
            let query = self.query_state_machine.clone();
            root.add_state_change_listener(move |state| match state {
                StageExecutionState::Finished => {
                    query.transition_to_finishing();
                }
                StageExecutionState::Canceled => {
                    // the output stage was canceled
                    query.transition_to_canceled();
                }
                _ => {}
            });
        }

        if let Some(last) = self.stage_executions.last() {
            let distributed_scheduler = self.distributed_scheduler.clone();
            last.add_state_change_listener(move |state| {
                if state == StageExecutionState::Flushing || state.is_done() {
                    if let Some(scheduler) = distributed_scheduler.get() {
                        scheduler.cancel();
                    }
                }
            });
        }
        Ok(())
    }

    /// Creates the single task of every coordinator stage. Only the first
    /// call does anything.
    pub fn schedule(&self) -> Result<()> {
        let mut scheduled = self.scheduled.lock();
        if *scheduled {
            return Ok(());
        }
        *scheduled = true;

        let failure_reporter = Arc::new(TaskFailureReporter {
            distributed_scheduler: self.distributed_scheduler.clone(),
        });
        self.query_state_machine
            .add_output_task_failure_listener(failure_reporter.clone());

        let coordinator = self
            .node_scheduler
            .create_node_selector(self.query_state_machine.session(), None)
            .select_current_node();
        for execution in &self.stage_executions {
            let task = execution.schedule_task(&coordinator, 0, SplitAssignments::new())?;
            execution.scheduling_complete();
            if let Some(task) = task {
                self.coordinator_task_manager
                    .add_source_task_failure_listener(task.task_id(), failure_reporter.clone());
                if self.query_state_machine.state() == QueryState::Starting {
                    self.query_state_machine.transition_to_running();
                }
            }
        }
        Ok(())
    }

    /// Hands the spooled output of the distributed stages to the coordinator
    /// task reading it, or to the query result when there is none.
    pub fn set_spooling_exchange_inputs(&self, inputs: Vec<ExchangeInput>) -> Result<()> {
        let scheduled = self.scheduled.lock();
        verify(*scheduled, || "Coordinator stages are expected to be scheduled".to_string())?;
        let Some(execution) = self.stage_executions.last() else {
            self.query_state_machine.update_inputs_for_query_results(inputs, true);
            return Ok(());
        };
        let tasks = execution.all_tasks();
        let Some(task) = tasks.first() else {
            // scheduled without tasks: the query is already terminated
            return Ok(());
        };
        verify(tasks.len() == 1, || {
            format!("Coordinator stage {} has {} tasks", execution.stage_id(), tasks.len())
        })?;
        let remote_sources = &execution.fragment().remote_source_nodes;
        verify(remote_sources.len() == 1, || {
            format!(
                "Coordinator stage {} has {} remote sources",
                execution.stage_id(),
                remote_sources.len()
            )
        })?;
        let remote_source = &remote_sources[0];
        for input in inputs {
            let mut splits = SplitAssignments::new();
            splits.insert(remote_source.id.clone(), vec![Split::remote(input)]);
            task.add_splits(splits);
        }
        task.no_more_splits(&remote_source.id);
        Ok(())
    }

    pub fn output_buffer_managers(&self) -> &OutputBufferManagers {
        &self.output_buffer_managers
    }

    pub fn bucket_to_partition(&self) -> &HashMap<PlanFragmentId, Option<Vec<u32>>> {
        &self.bucket_to_partition
    }

    /// Listener for the tasks of the distributed stages read by the
    /// coordinator.
    pub fn task_lifecycle_listener(&self) -> Arc<dyn TaskLifecycleListener> {
        self.task_lifecycle_listener.clone()
    }

    pub fn stage_executions(&self) -> &[Arc<StageExecution>] {
        &self.stage_executions
    }

    pub fn cancel_stage(&self, stage_id: &StageId) {
        for execution in &self.stage_executions {
            if execution.stage_id() == stage_id {
                execution.cancel();
            }
        }
    }

    pub fn cancel(&self) {
        for execution in &self.stage_executions {
            execution.cancel();
        }
    }

    pub fn abort(&self) {
        for execution in &self.stage_executions {
            execution.abort();
        }
    }
}
