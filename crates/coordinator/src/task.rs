//! The coordinator side view of tasks running on workers.

use crate::fragment::PlanFragment;
use crate::node::{FailureDetector, InternalNode, NodeHealth};
use crate::output_buffers::OutputBuffers;
use crate::query::Session;
use crate::split::SplitAssignments;
use crate::state_machine::StateChangeListener;
use igloo_common::{ErrorCode, ExecutionFailure, PlanFragmentId, PlanNodeId, TaskId};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Planned,
    Running,
    Flushing,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Aborted | TaskState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub node: InternalNode,
    /// Base URI of the task; results are read from `<self_location>/results/<buffer>`.
    pub self_location: String,
    pub output_buffer_overutilized: bool,
    pub physical_written_bytes: u64,
    pub user_memory_reservation_bytes: u64,
    pub revocable_memory_reservation_bytes: u64,
    pub peak_memory_reservation_bytes: u64,
    pub cpu_time: Duration,
    pub failure: Option<ExecutionFailure>,
}

impl TaskStatus {
    pub fn initial(task_id: TaskId, node: InternalNode, self_location: impl Into<String>) -> Self {
        Self {
            task_id,
            state: TaskState::Planned,
            node,
            self_location: self_location.into(),
            output_buffer_overutilized: false,
            physical_written_bytes: 0,
            user_memory_reservation_bytes: 0,
            revocable_memory_reservation_bytes: 0,
            peak_memory_reservation_bytes: 0,
            cpu_time: Duration::ZERO,
            failure: None,
        }
    }

    pub fn result_location(&self, buffer_id: u32) -> String {
        format!("{}/results/{}", self.self_location, buffer_id)
    }
}

pub trait RemoteTask: Send + Sync {
    fn task_id(&self) -> &TaskId;

    fn node(&self) -> &InternalNode;

    fn task_status(&self) -> TaskStatus;

    fn start(&self);

    fn add_splits(&self, splits: SplitAssignments);

    fn no_more_splits(&self, plan_node_id: &PlanNodeId);

    fn set_output_buffers(&self, output_buffers: OutputBuffers);

    /// Listeners are notified asynchronously, once per status change.
    fn add_state_change_listener(&self, listener: StateChangeListener<TaskStatus>);

    fn cancel(&self);

    fn abort(&self);

    /// Marks the task failed on the coordinator without contacting the worker.
    fn fail_locally(&self, cause: ExecutionFailure);

    /// Asks the worker to fail the task.
    fn fail_remotely(&self, cause: ExecutionFailure);
}

pub trait RemoteTaskFactory: Send + Sync {
    fn create_remote_task(
        &self,
        session: &Session,
        task_id: TaskId,
        node: &InternalNode,
        fragment: &Arc<PlanFragment>,
        initial_splits: SplitAssignments,
        output_buffers: OutputBuffers,
    ) -> Arc<dyn RemoteTask>;
}

/// Observes the tasks a stage creates. Consumers use it to learn where to
/// read upstream output from.
pub trait TaskLifecycleListener: Send + Sync {
    fn task_created(&self, fragment_id: PlanFragmentId, task: Arc<dyn RemoteTask>);

    fn no_more_tasks(&self, fragment_id: PlanFragmentId);
}

pub trait TaskFailureListener: Send + Sync {
    fn on_task_failed(&self, task_id: &TaskId, failure: &ExecutionFailure);
}

/// The local task manager of the coordinator. Coordinator tasks report
/// failures of the upstream tasks they read from through it.
pub trait CoordinatorTaskManager: Send + Sync {
    fn add_source_task_failure_listener(&self, task_id: &TaskId, listener: Arc<dyn TaskFailureListener>);
}

/// The cause recorded for a failed task. Failures on a node the failure
/// detector considers gone are reclassified as external.
pub(crate) fn task_failure_cause(status: &TaskStatus, failure_detector: &dyn FailureDetector) -> ExecutionFailure {
    let failure = status.failure.clone().unwrap_or_else(|| {
        ExecutionFailure::internal(format!("A task failed for an unknown reason: {}", status.task_id))
    });
    let already_external = matches!(failure.error_code(), Some(code) if code == ErrorCode::REMOTE_HOST_GONE);
    if already_external || failure_detector.node_health(&status.node) != NodeHealth::Gone {
        return failure;
    }
    let mut rewritten = ExecutionFailure::new(
        ErrorCode::REMOTE_HOST_GONE,
        format!("Node {} running task {} is gone: {}", status.node, status.task_id, failure),
    );
    rewritten.add_suppressed(failure);
    rewritten
}
