//! Stages of a query: one per plan fragment, arranged as the fragment tree.
//!
//! A `SqlStage` outlives the executions scheduled for it. Query retries
//! create new executions of the same stage, and the stage records the final
//! outcome once the query settles.

use crate::error::{verify, CoordinatorError, Result};
use crate::fragment::{PlanFragment, SubPlan};
use crate::node::InternalNode;
use crate::output_buffers::OutputBuffers;
use crate::query::{QueryStateMachine, Session};
use crate::split::SplitAssignments;
use crate::task::{RemoteTask, RemoteTaskFactory, TaskState, TaskStatus};
use chrono::{DateTime, Utc};
use igloo_common::{ExecutionFailure, PlanFragmentId, StageId, TaskId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    Active,
    Finished,
    Aborted,
    Failed,
}

impl StageState {
    pub fn is_done(&self) -> bool {
        !matches!(self, StageState::Active)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicStageStats {
    pub total_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub user_memory_reservation_bytes: u64,
    pub total_memory_reservation_bytes: u64,
    pub physical_written_bytes: u64,
    pub cpu_time: Duration,
}

impl BasicStageStats {
    fn add_task(&mut self, status: &TaskStatus) {
        self.total_tasks += 1;
        match status.state {
            TaskState::Planned | TaskState::Running | TaskState::Flushing => self.running_tasks += 1,
            TaskState::Finished => self.completed_tasks += 1,
            TaskState::Failed => self.failed_tasks += 1,
            TaskState::Canceled | TaskState::Aborted => {}
        }
        if !status.state.is_done() {
            self.user_memory_reservation_bytes += status.user_memory_reservation_bytes;
            self.total_memory_reservation_bytes +=
                status.user_memory_reservation_bytes + status.revocable_memory_reservation_bytes;
        }
        self.physical_written_bytes += status.physical_written_bytes;
        self.cpu_time += status.cpu_time;
    }

    pub fn merge(&mut self, other: &BasicStageStats) {
        self.total_tasks += other.total_tasks;
        self.running_tasks += other.running_tasks;
        self.completed_tasks += other.completed_tasks;
        self.failed_tasks += other.failed_tasks;
        self.user_memory_reservation_bytes += other.user_memory_reservation_bytes;
        self.total_memory_reservation_bytes += other.total_memory_reservation_bytes;
        self.physical_written_bytes += other.physical_written_bytes;
        self.cpu_time += other.cpu_time;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub state: StageState,
    pub coordinator_only: bool,
    pub stats: BasicStageStats,
    pub tasks: Vec<TaskStatus>,
    pub failure_cause: Option<ExecutionFailure>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sub_stages: Vec<StageInfo>,
}

struct StageOutcome {
    state: StageState,
    failure_cause: Option<ExecutionFailure>,
    completed_at: Option<DateTime<Utc>>,
}

pub struct SqlStage {
    session: Session,
    stage_id: StageId,
    fragment: Arc<PlanFragment>,
    remote_task_factory: Arc<dyn RemoteTaskFactory>,
    outcome: Mutex<StageOutcome>,
    tasks: Mutex<Vec<Arc<dyn RemoteTask>>>,
}

impl SqlStage {
    pub fn new(
        session: Session,
        fragment: Arc<PlanFragment>,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
    ) -> Arc<Self> {
        let stage_id = StageId::from_fragment(session.query_id().clone(), fragment.id);
        Arc::new(Self {
            session,
            stage_id,
            fragment,
            remote_task_factory,
            outcome: Mutex::new(StageOutcome {
                state: StageState::Active,
                failure_cause: None,
                completed_at: None,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn stage_id(&self) -> &StageId {
        &self.stage_id
    }

    pub fn fragment(&self) -> &Arc<PlanFragment> {
        &self.fragment
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> StageState {
        self.outcome.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn failure_cause(&self) -> Option<ExecutionFailure> {
        self.outcome.lock().failure_cause.clone()
    }

    /// Creates a task for `partition`. Returns `None` once the stage has
    /// reached its final outcome.
    pub fn create_task(
        &self,
        node: &InternalNode,
        partition: u32,
        attempt: u32,
        initial_splits: SplitAssignments,
        output_buffers: OutputBuffers,
    ) -> Option<Arc<dyn RemoteTask>> {
        if self.is_done() {
            return None;
        }
        let task_id = TaskId::new(self.stage_id.clone(), partition, attempt);
        debug!("Creating task {} on {}", task_id, node);
        let task = self.remote_task_factory.create_remote_task(
            &self.session,
            task_id,
            node,
            &self.fragment,
            initial_splits,
            output_buffers,
        );
        self.tasks.lock().push(task.clone());
        Some(task)
    }

    pub fn all_tasks(&self) -> Vec<Arc<dyn RemoteTask>> {
        self.tasks.lock().clone()
    }

    pub fn finish(&self) -> bool {
        self.complete(StageState::Finished, None)
    }

    pub fn abort(&self) -> bool {
        self.complete(StageState::Aborted, None)
    }

    pub fn fail(&self, cause: ExecutionFailure) -> bool {
        self.complete(StageState::Failed, Some(cause))
    }

    fn complete(&self, state: StageState, failure_cause: Option<ExecutionFailure>) -> bool {
        let mut outcome = self.outcome.lock();
        if outcome.state.is_done() {
            return false;
        }
        outcome.state = state;
        outcome.failure_cause = failure_cause;
        outcome.completed_at = Some(Utc::now());
        true
    }

    pub fn fail_task_remotely(&self, task_id: &TaskId, cause: ExecutionFailure) -> Result<()> {
        let task = self
            .tasks
            .lock()
            .iter()
            .find(|task| task.task_id() == task_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::InvalidState(format!("Task {} not found in stage {}", task_id, self.stage_id)))?;
        task.fail_remotely(cause);
        Ok(())
    }

    pub fn basic_stats(&self) -> BasicStageStats {
        let mut stats = BasicStageStats::default();
        for task in self.all_tasks() {
            stats.add_task(&task.task_status());
        }
        stats
    }

    fn stage_info(&self, sub_stages: Vec<StageInfo>) -> StageInfo {
        let tasks: Vec<TaskStatus> = self.all_tasks().iter().map(|task| task.task_status()).collect();
        let mut stats = BasicStageStats::default();
        for status in &tasks {
            stats.add_task(status);
        }
        let outcome = self.outcome.lock();
        StageInfo {
            stage_id: self.stage_id.clone(),
            state: outcome.state,
            coordinator_only: self.fragment.partitioning.is_coordinator_only(),
            stats,
            tasks,
            failure_cause: outcome.failure_cause.clone(),
            completed_at: outcome.completed_at,
            sub_stages,
        }
    }
}

pub struct StageManager {
    query_state_machine: Arc<QueryStateMachine>,
    stages: HashMap<StageId, Arc<SqlStage>>,
    topological_order: Vec<StageId>,
    parents: HashMap<StageId, StageId>,
    children: HashMap<StageId, Vec<StageId>>,
}

impl StageManager {
    pub fn create(
        query_state_machine: Arc<QueryStateMachine>,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
        plan: &SubPlan,
    ) -> Result<Arc<Self>> {
        let mut manager = StageManager {
            query_state_machine,
            stages: HashMap::new(),
            topological_order: Vec::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
        };
        manager.add_stages(plan, None, &remote_task_factory)?;
        Ok(Arc::new(manager))
    }

    fn add_stages(
        &mut self,
        plan: &SubPlan,
        parent: Option<&StageId>,
        remote_task_factory: &Arc<dyn RemoteTaskFactory>,
    ) -> Result<()> {
        let stage = SqlStage::new(
            self.query_state_machine.session().clone(),
            plan.fragment.clone(),
            remote_task_factory.clone(),
        );
        let stage_id = stage.stage_id().clone();
        verify(!self.stages.contains_key(&stage_id), || format!("Duplicate stage {}", stage_id))?;
        if let Some(parent_id) = parent {
            let parent_coordinator_only = self
                .stages
                .get(parent_id)
                .map(|parent| parent.fragment().partitioning.is_coordinator_only())
                .unwrap_or(false);
            verify(
                parent_coordinator_only || !plan.fragment.partitioning.is_coordinator_only(),
                || format!("Coordinator only stage {} must not have a distributed parent", stage_id),
            )?;
            self.parents.insert(stage_id.clone(), parent_id.clone());
            self.children.entry(parent_id.clone()).or_default().push(stage_id.clone());
        }
        self.stages.insert(stage_id.clone(), stage);
        self.topological_order.push(stage_id.clone());
        for child in &plan.children {
            self.add_stages(child, Some(&stage_id), remote_task_factory)?;
        }
        Ok(())
    }

    pub fn query_state_machine(&self) -> &Arc<QueryStateMachine> {
        &self.query_state_machine
    }

    pub fn get(&self, stage_id: &StageId) -> Option<&Arc<SqlStage>> {
        self.stages.get(stage_id)
    }

    pub fn get_by_fragment(&self, fragment_id: PlanFragmentId) -> Option<&Arc<SqlStage>> {
        self.get(&StageId::from_fragment(self.query_state_machine.query_id().clone(), fragment_id))
    }

    pub fn output_stage(&self) -> Result<&Arc<SqlStage>> {
        self.topological_order
            .first()
            .and_then(|stage_id| self.stages.get(stage_id))
            .ok_or_else(|| CoordinatorError::Internal("Query has no stages".to_string()))
    }

    pub fn all_stages_in_topological_order(&self) -> Vec<Arc<SqlStage>> {
        self.topological_order
            .iter()
            .filter_map(|stage_id| self.stages.get(stage_id).cloned())
            .collect()
    }

    pub fn coordinator_stages_in_topological_order(&self) -> Vec<Arc<SqlStage>> {
        self.all_stages_in_topological_order()
            .into_iter()
            .filter(|stage| stage.fragment().partitioning.is_coordinator_only())
            .collect()
    }

    pub fn distributed_stages_in_topological_order(&self) -> Vec<Arc<SqlStage>> {
        self.all_stages_in_topological_order()
            .into_iter()
            .filter(|stage| !stage.fragment().partitioning.is_coordinator_only())
            .collect()
    }

    pub fn parent(&self, stage_id: &StageId) -> Option<&Arc<SqlStage>> {
        self.parents.get(stage_id).and_then(|parent| self.stages.get(parent))
    }

    pub fn children(&self, stage_id: &StageId) -> Vec<Arc<SqlStage>> {
        self.children
            .get(stage_id)
            .map(|children| {
                children
                    .iter()
                    .filter_map(|child| self.stages.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn finish(&self) {
        for stage in self.stages.values() {
            stage.finish();
        }
    }

    pub fn abort(&self) {
        for stage in self.stages.values() {
            stage.abort();
        }
    }

    pub fn fail_task_remotely(&self, task_id: &TaskId, cause: ExecutionFailure) -> Result<()> {
        let stage = self
            .get(task_id.stage_id())
            .ok_or_else(|| CoordinatorError::InvalidState(format!("Stage {} not found", task_id.stage_id())))?;
        stage.fail_task_remotely(task_id, cause)
    }

    pub fn basic_stage_stats(&self) -> BasicStageStats {
        let mut stats = BasicStageStats::default();
        for stage in self.stages.values() {
            stats.merge(&stage.basic_stats());
        }
        stats
    }

    pub fn stage_info(&self) -> Result<StageInfo> {
        Ok(self.build_stage_info(self.output_stage()?))
    }

    fn build_stage_info(&self, stage: &Arc<SqlStage>) -> StageInfo {
        let sub_stages = self
            .children(stage.stage_id())
            .iter()
            .map(|child| self.build_stage_info(child))
            .collect();
        stage.stage_info(sub_stages)
    }

    pub fn user_memory_reservation(&self) -> u64 {
        self.basic_stage_stats().user_memory_reservation_bytes
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.basic_stage_stats().total_memory_reservation_bytes
    }

    pub fn total_cpu_time(&self) -> Duration {
        self.basic_stage_stats().cpu_time
    }
}
