//! One attempt at running a stage in pipelined mode.
//!
//! Tracks the tasks of the attempt, wires them to upstream and downstream
//! stages through [`TaskLifecycleListener`]s and derives the stage state
//! from the states of its tasks.

use crate::error::{CoordinatorError, Result};
use crate::exchange::ExchangeInput;
use crate::fragment::{PlanFragment, RemoteSourceNode};
use crate::node::{FailureDetector, InternalNode};
use crate::output_buffers::OutputBufferManager;
use crate::split::{Split, SplitAssignments};
use crate::stage::SqlStage;
use crate::state_machine::{State, StateMachine};
use crate::task::{task_failure_cause, RemoteTask, TaskLifecycleListener, TaskState, TaskStatus};
use igloo_common::{ExecutionFailure, PlanFragmentId, PlanNodeId, StageId, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageExecutionState {
    Planned,
    Scheduling,
    Scheduled,
    Running,
    Flushing,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl State for StageExecutionState {
    fn is_done(&self) -> bool {
        matches!(
            self,
            StageExecutionState::Finished
                | StageExecutionState::Canceled
                | StageExecutionState::Aborted
                | StageExecutionState::Failed
        )
    }
}

impl StageExecutionState {
    pub fn is_done(&self) -> bool {
        State::is_done(self)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageExecutionState::Aborted | StageExecutionState::Failed)
    }

    pub fn can_schedule_more_tasks(&self) -> bool {
        matches!(self, StageExecutionState::Planned | StageExecutionState::Scheduling)
    }
}

pub type OutputBufferManagers = HashMap<PlanFragmentId, Arc<OutputBufferManager>>;

#[derive(Default)]
struct TaskTracker {
    all_tasks: Vec<Arc<dyn RemoteTask>>,
    partitions: HashSet<u32>,
    flushing_tasks: HashSet<TaskId>,
    finished_tasks: HashSet<TaskId>,
    source_tasks: HashMap<PlanFragmentId, Vec<Arc<dyn RemoteTask>>>,
    completed_sources: HashSet<PlanFragmentId>,
    completed_partitioned_sources: HashSet<PlanNodeId>,
}

impl TaskTracker {
    fn all_finished(&self) -> bool {
        self.all_tasks
            .iter()
            .all(|task| self.finished_tasks.contains(task.task_id()))
    }

    fn all_flushing_or_finished(&self) -> bool {
        self.all_tasks.iter().all(|task| {
            self.flushing_tasks.contains(task.task_id()) || self.finished_tasks.contains(task.task_id())
        })
    }

    fn is_remote_source_complete(&self, remote_source: &RemoteSourceNode) -> bool {
        remote_source
            .source_fragment_ids
            .iter()
            .all(|fragment_id| self.completed_sources.contains(fragment_id))
    }
}

pub struct StageExecution {
    stage: Arc<SqlStage>,
    attempt: u32,
    state_machine: StateMachine<StageExecutionState>,
    failure_cause: Mutex<Option<ExecutionFailure>>,
    output_buffer_managers: Arc<OutputBufferManagers>,
    bucket_to_partition: Option<Vec<u32>>,
    task_lifecycle_listener: Arc<dyn TaskLifecycleListener>,
    failure_detector: Arc<dyn FailureDetector>,
    exchange_sources: HashMap<PlanFragmentId, RemoteSourceNode>,
    tasks: Mutex<TaskTracker>,
    self_ref: Weak<StageExecution>,
}

impl StageExecution {
    pub fn create(
        stage: Arc<SqlStage>,
        attempt: u32,
        output_buffer_managers: Arc<OutputBufferManagers>,
        task_lifecycle_listener: Arc<dyn TaskLifecycleListener>,
        failure_detector: Arc<dyn FailureDetector>,
        bucket_to_partition: Option<Vec<u32>>,
        executor: Handle,
    ) -> Result<Arc<Self>> {
        let fragment = stage.fragment().clone();
        if !output_buffer_managers.contains_key(&fragment.id) {
            return Err(CoordinatorError::Internal(format!(
                "No output buffer manager for fragment {}",
                fragment.id
            )));
        }
        let mut exchange_sources = HashMap::new();
        for remote_source in &fragment.remote_source_nodes {
            for fragment_id in &remote_source.source_fragment_ids {
                exchange_sources.insert(*fragment_id, remote_source.clone());
            }
        }
        let state_machine = StateMachine::new(
            format!("stage execution {} attempt {}", stage.stage_id(), attempt),
            executor,
            StageExecutionState::Planned,
        );
        Ok(Arc::new_cyclic(|self_ref| StageExecution {
            stage,
            attempt,
            state_machine,
            failure_cause: Mutex::new(None),
            output_buffer_managers,
            bucket_to_partition,
            task_lifecycle_listener,
            failure_detector,
            exchange_sources,
            tasks: Mutex::new(TaskTracker::default()),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn stage(&self) -> &Arc<SqlStage> {
        &self.stage
    }

    pub fn stage_id(&self) -> &StageId {
        self.stage.stage_id()
    }

    pub fn fragment(&self) -> &Arc<PlanFragment> {
        self.stage.fragment()
    }

    pub fn attempt_id(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> StageExecutionState {
        self.state_machine.get()
    }

    pub fn failure_cause(&self) -> Option<ExecutionFailure> {
        self.failure_cause.lock().clone()
    }

    pub fn bucket_to_partition(&self) -> Option<&[u32]> {
        self.bucket_to_partition.as_deref()
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(StageExecutionState) + Send + Sync + 'static) {
        self.state_machine.add_listener(listener);
    }

    pub async fn wait_for_state(&self, predicate: impl Fn(StageExecutionState) -> bool) -> StageExecutionState {
        self.state_machine.wait_for(predicate).await
    }

    pub fn begin_scheduling(&self) {
        self.state_machine
            .set_if(StageExecutionState::Scheduling, |current| current == StageExecutionState::Planned);
    }

    pub fn transition_to_running(&self) -> bool {
        self.state_machine
            .set_if(StageExecutionState::Running, |current| current < StageExecutionState::Running)
    }

    pub fn transition_to_flushing(&self) -> bool {
        self.state_machine
            .set_if(StageExecutionState::Flushing, |current| current < StageExecutionState::Flushing)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.state_machine.set(StageExecutionState::Finished)
    }

    /// Marks the end of task creation. Called exactly once by the scheduling
    /// loop; later calls have no effect.
    pub fn scheduling_complete(&self) {
        let scheduled = self
            .state_machine
            .set_if(StageExecutionState::Scheduled, |current| current < StageExecutionState::Scheduled);
        if !scheduled {
            return;
        }
        let (all_flushing, all_finished) = {
            let tracker = self.tasks.lock();
            (tracker.all_flushing_or_finished(), tracker.all_finished())
        };
        if all_flushing {
            self.transition_to_flushing();
        }
        if all_finished {
            self.transition_to_finished();
        }
        for partitioned_source in &self.fragment().partitioned_sources {
            self.no_more_splits(partitioned_source);
        }
        self.task_lifecycle_listener.no_more_tasks(self.fragment().id);
        self.update_source_tasks_output_buffers(OutputBufferManager::no_more_buffers);
    }

    pub fn cancel(&self) {
        self.state_machine.set(StageExecutionState::Canceled);
        for task in self.all_tasks() {
            task.cancel();
        }
    }

    pub fn abort(&self) {
        self.state_machine.set(StageExecutionState::Aborted);
        for task in self.all_tasks() {
            task.abort();
        }
    }

    pub fn fail(&self, cause: ExecutionFailure) {
        {
            let mut failure_cause = self.failure_cause.lock();
            if failure_cause.is_none() && !self.state().is_done() {
                *failure_cause = Some(cause);
            }
        }
        self.state_machine.set(StageExecutionState::Failed);
        for task in self.all_tasks() {
            task.abort();
        }
    }

    /// Fails one task locally and, with it, the whole stage execution.
    pub fn fail_task(&self, task_id: &TaskId, cause: ExecutionFailure) -> Result<()> {
        let task = self
            .find_task(task_id)
            .ok_or_else(|| CoordinatorError::InvalidState(format!("Task {} not found in {}", task_id, self.stage_id())))?;
        task.fail_locally(cause.clone());
        self.fail(cause);
        Ok(())
    }

    pub fn find_task(&self, task_id: &TaskId) -> Option<Arc<dyn RemoteTask>> {
        self.tasks
            .lock()
            .all_tasks
            .iter()
            .find(|task| task.task_id() == task_id)
            .cloned()
    }

    pub fn all_tasks(&self) -> Vec<Arc<dyn RemoteTask>> {
        self.tasks.lock().all_tasks.clone()
    }

    pub fn task_statuses(&self) -> Vec<TaskStatus> {
        self.all_tasks().iter().map(|task| task.task_status()).collect()
    }

    pub fn is_any_task_blocked(&self) -> bool {
        self.task_statuses().iter().any(|status| status.output_buffer_overutilized)
    }

    /// Creates the task for `partition` on `node`. Returns `None` when the
    /// execution is already done.
    pub fn schedule_task(
        &self,
        node: &InternalNode,
        partition: u32,
        initial_splits: SplitAssignments,
    ) -> Result<Option<Arc<dyn RemoteTask>>> {
        if self.state().is_done() {
            return Ok(None);
        }
        let task = {
            let mut tracker = self.tasks.lock();
            if tracker.partitions.contains(&partition) {
                return Err(CoordinatorError::InvalidState(format!(
                    "A task for partition {} already exists in {}",
                    partition,
                    self.stage_id()
                )));
            }

            let mut splits = initial_splits;
            for (fragment_id, source_tasks) in &tracker.source_tasks {
                let Some(remote_source) = self.exchange_sources.get(fragment_id) else {
                    continue;
                };
                let remote_splits = splits.entry(remote_source.id.clone()).or_default();
                for source_task in source_tasks {
                    remote_splits.push(exchange_split(source_task.as_ref(), partition));
                }
            }

            let output_buffers = self.own_output_buffer_manager()?.output_buffers();
            let Some(task) = self
                .stage
                .create_task(node, partition, self.attempt, splits, output_buffers)
            else {
                return Ok(None);
            };
            tracker.partitions.insert(partition);
            tracker.all_tasks.push(task.clone());

            for remote_source in &self.fragment().remote_source_nodes {
                if tracker.is_remote_source_complete(remote_source) {
                    task.no_more_splits(&remote_source.id);
                }
            }
            for partitioned_source in &tracker.completed_partitioned_sources {
                task.no_more_splits(partitioned_source);
            }
            task
        };

        let execution = self.self_ref.clone();
        task.add_state_change_listener(Arc::new(move |status: TaskStatus| {
            if let Some(execution) = execution.upgrade() {
                execution.update_task_status(&status);
            }
        }));

        self.update_source_tasks_output_buffers(|manager| manager.add_output_buffer(partition));
        self.task_lifecycle_listener.task_created(self.fragment().id, task.clone());

        if self.state().is_done() {
            task.abort();
        } else {
            task.start();
        }
        Ok(Some(task))
    }

    pub fn add_splits(&self, task_id: &TaskId, splits: SplitAssignments) -> Result<()> {
        let task = self
            .find_task(task_id)
            .ok_or_else(|| CoordinatorError::InvalidState(format!("Task {} not found in {}", task_id, self.stage_id())))?;
        task.add_splits(splits);
        Ok(())
    }

    /// Tells every task, current and future, that `plan_node_id` receives no
    /// more splits.
    pub fn no_more_splits(&self, plan_node_id: &PlanNodeId) {
        let tasks = {
            let mut tracker = self.tasks.lock();
            if !tracker.completed_partitioned_sources.insert(plan_node_id.clone()) {
                return;
            }
            tracker.all_tasks.clone()
        };
        for task in tasks {
            task.no_more_splits(plan_node_id);
        }
    }

    /// The listener the consuming side gives to the stages it reads from.
    pub fn task_lifecycle_listener(&self) -> Arc<dyn TaskLifecycleListener> {
        Arc::new(ExchangeLocationListener {
            execution: self.self_ref.clone(),
        })
    }

    fn add_exchange_location(&self, fragment_id: PlanFragmentId, source_task: Arc<dyn RemoteTask>) {
        let Some(remote_source) = self.exchange_sources.get(&fragment_id) else {
            warn!("Stage {} does not read from fragment {}", self.stage_id(), fragment_id);
            return;
        };
        if let Some(manager) = self.output_buffer_managers.get(&fragment_id) {
            source_task.set_output_buffers(manager.output_buffers());
        }
        let mut tracker = self.tasks.lock();
        for destination in &tracker.all_tasks {
            let mut splits = SplitAssignments::new();
            splits.insert(
                remote_source.id.clone(),
                vec![exchange_split(source_task.as_ref(), destination.task_id().partition_id())],
            );
            destination.add_splits(splits);
        }
        tracker.source_tasks.entry(fragment_id).or_default().push(source_task);
    }

    fn no_more_exchange_locations(&self, fragment_id: PlanFragmentId) {
        let Some(remote_source) = self.exchange_sources.get(&fragment_id) else {
            return;
        };
        let mut tracker = self.tasks.lock();
        tracker.completed_sources.insert(fragment_id);
        if tracker.is_remote_source_complete(remote_source) {
            for task in &tracker.all_tasks {
                task.no_more_splits(&remote_source.id);
            }
        }
    }

    fn own_output_buffer_manager(&self) -> Result<&Arc<OutputBufferManager>> {
        self.output_buffer_managers.get(&self.fragment().id).ok_or_else(|| {
            CoordinatorError::Internal(format!("No output buffer manager for fragment {}", self.fragment().id))
        })
    }

    fn update_source_tasks_output_buffers(&self, update: impl Fn(&OutputBufferManager)) {
        let tracker = self.tasks.lock();
        for fragment_id in self.exchange_sources.keys() {
            let Some(manager) = self.output_buffer_managers.get(fragment_id) else {
                continue;
            };
            update(manager.as_ref());
            let output_buffers = manager.output_buffers();
            for source_task in tracker.source_tasks.get(fragment_id).into_iter().flatten() {
                source_task.set_output_buffers(output_buffers.clone());
            }
        }
    }

    fn update_task_status(&self, status: &TaskStatus) {
        let stage_state = self.state();
        if stage_state.is_done() {
            return;
        }
        match status.state {
            TaskState::Failed => {
                let cause = task_failure_cause(status, self.failure_detector.as_ref());
                debug!("Task {} failed: {}", status.task_id, cause);
                self.fail(cause);
            }
            TaskState::Canceled | TaskState::Aborted => {
                self.fail(ExecutionFailure::internal(format!(
                    "A task is in the {:?} state but stage is {:?}",
                    status.state, stage_state
                )));
            }
            TaskState::Flushing => {
                self.tasks.lock().flushing_tasks.insert(status.task_id.clone());
            }
            TaskState::Finished => {
                let mut tracker = self.tasks.lock();
                tracker.flushing_tasks.remove(&status.task_id);
                tracker.finished_tasks.insert(status.task_id.clone());
            }
            TaskState::Planned | TaskState::Running => {}
        }

        if matches!(
            stage_state,
            StageExecutionState::Scheduled | StageExecutionState::Running | StageExecutionState::Flushing
        ) {
            if status.state == TaskState::Running {
                self.transition_to_running();
            }
            let (all_flushing, all_finished) = {
                let tracker = self.tasks.lock();
                (tracker.all_flushing_or_finished(), tracker.all_finished())
            };
            if all_flushing {
                self.transition_to_flushing();
            }
            if all_finished {
                self.transition_to_finished();
            }
        }
    }
}

struct ExchangeLocationListener {
    execution: Weak<StageExecution>,
}

impl TaskLifecycleListener for ExchangeLocationListener {
    fn task_created(&self, fragment_id: PlanFragmentId, task: Arc<dyn RemoteTask>) {
        if let Some(execution) = self.execution.upgrade() {
            execution.add_exchange_location(fragment_id, task);
        }
    }

    fn no_more_tasks(&self, fragment_id: PlanFragmentId) {
        if let Some(execution) = self.execution.upgrade() {
            execution.no_more_exchange_locations(fragment_id);
        }
    }
}

fn exchange_split(source_task: &dyn RemoteTask, destination_partition: u32) -> Split {
    let status = source_task.task_status();
    Split::remote(ExchangeInput::Direct {
        task_id: status.task_id.clone(),
        location: status.result_location(destination_partition),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(StageExecutionState::Planned.can_schedule_more_tasks());
        assert!(StageExecutionState::Scheduling.can_schedule_more_tasks());
        assert!(!StageExecutionState::Scheduled.can_schedule_more_tasks());
        assert!(StageExecutionState::Aborted.is_failure());
        assert!(StageExecutionState::Failed.is_failure());
        assert!(!StageExecutionState::Canceled.is_failure());
        assert!(StageExecutionState::Canceled.is_done());
        assert!(!StageExecutionState::Flushing.is_done());
        assert!(StageExecutionState::Scheduled < StageExecutionState::Running);
    }
}
