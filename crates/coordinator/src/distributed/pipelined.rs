use super::{DistributedStagesSchedulerState, DistributedStagesSchedulerStateMachine};
use crate::config::RetryPolicy;
use crate::coordinator_stages::CoordinatorStagesScheduler;
use crate::error::{combine_failures, verify, CoordinatorError, Result};
use crate::execution_schedule::{ExecutionSchedule, StagesScheduleResult};
use crate::fragment::{PartitioningHandle, PlanFragment};
use crate::node::{NodePartitionMap, NodePartitioningManager};
use crate::output_buffers::OutputBufferManager;
use crate::query::{QueryStateMachine, Session};
use crate::services::SchedulerServices;
use crate::split::SplitSource;
use crate::stage::StageManager;
use crate::stage_execution::{OutputBufferManagers, StageExecution, StageExecutionState};
use crate::stage_scheduler::{
    BlockedReason, DynamicSplitPlacementPolicy, FixedCountScheduler, FixedSourcePartitionedScheduler,
    ScaledWriterScheduler, SourcePartitionedScheduler, StageScheduler, TaskStatusProvider,
};
use crate::stats::SplitSchedulerStats;
use crate::task::{RemoteTask, TaskLifecycleListener};
use crate::unblock;
use igloo_common::{ErrorCode, ExecutionFailure, PlanFragmentId, StageId, TaskId};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const BLOCKED_WAIT: Duration = Duration::from_secs(1);

/// Node partition maps resolved once per partitioning handle.
struct PartitioningCache {
    session: Session,
    node_partitioning_manager: Arc<dyn NodePartitioningManager>,
    maps: HashMap<PartitioningHandle, NodePartitionMap>,
}

impl PartitioningCache {
    fn get(&mut self, partitioning: &PartitioningHandle) -> Result<NodePartitionMap> {
        if let Some(map) = self.maps.get(partitioning) {
            return Ok(map.clone());
        }
        let map = self
            .node_partitioning_manager
            .node_partitioning_map(&self.session, partitioning)?;
        self.maps.insert(partitioning.clone(), map.clone());
        Ok(map)
    }
}

/// Holds back "no more tasks" for stages read by the coordinator until the
/// distributed scheduler finishes, so that a new attempt can still add
/// inputs.
struct TaskLifecycleListenerBridge {
    listener: Arc<dyn TaskLifecycleListener>,
    state: Mutex<BridgeState>,
}

#[derive(Default)]
struct BridgeState {
    no_more_source_tasks: HashSet<PlanFragmentId>,
    done: bool,
}

impl TaskLifecycleListenerBridge {
    fn new(listener: Arc<dyn TaskLifecycleListener>) -> Self {
        Self {
            listener,
            state: Mutex::new(BridgeState::default()),
        }
    }

    fn notify_no_more_source_tasks(&self) {
        let fragments = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            std::mem::take(&mut state.no_more_source_tasks)
        };
        for fragment_id in fragments {
            self.listener.no_more_tasks(fragment_id);
        }
    }
}

impl TaskLifecycleListener for TaskLifecycleListenerBridge {
    fn task_created(&self, fragment_id: PlanFragmentId, task: Arc<dyn RemoteTask>) {
        if self.state.lock().done {
            warn!("Task {} created after its consumer saw all tasks", task.task_id());
            return;
        }
        self.listener.task_created(fragment_id, task);
    }

    fn no_more_tasks(&self, fragment_id: PlanFragmentId) {
        let mut state = self.state.lock();
        if !state.done {
            state.no_more_source_tasks.insert(fragment_id);
        }
    }
}

struct SchedulingWork {
    execution_schedule: Box<dyn ExecutionSchedule>,
    stage_schedulers: HashMap<StageId, Box<dyn StageScheduler>>,
}

/// Streams data between stages over live connections. Nothing is persisted,
/// so any task failure fails this scheduler.
pub struct PipelinedDistributedStagesScheduler {
    state_machine: DistributedStagesSchedulerStateMachine,
    query_state_machine: Arc<QueryStateMachine>,
    scheduler_stats: Arc<SplitSchedulerStats>,
    stage_executions: HashMap<StageId, Arc<StageExecution>>,
    work: Mutex<Option<SchedulingWork>>,
}

impl PipelinedDistributedStagesScheduler {
    pub fn create(
        query_state_machine: &Arc<QueryStateMachine>,
        stage_manager: &Arc<StageManager>,
        coordinator_stages_scheduler: &CoordinatorStagesScheduler,
        services: &SchedulerServices,
        attempt: u32,
    ) -> Result<Arc<Self>> {
        let session = query_state_machine.session().clone();
        let state_machine =
            DistributedStagesSchedulerStateMachine::new(session.query_id().clone(), query_state_machine.executor().clone());
        let mut partitioning_cache = PartitioningCache {
            session: session.clone(),
            node_partitioning_manager: services.node_partitioning_manager.clone(),
            maps: HashMap::new(),
        };
        let distributed_stages = stage_manager.distributed_stages_in_topological_order();

        // the partitioning of a stage decides how its children lay out their output
        let mut bucket_to_partition = coordinator_stages_scheduler.bucket_to_partition().clone();
        for stage in &distributed_stages {
            let mapping = stage_bucket_to_partition(stage.fragment(), &mut partitioning_cache)?;
            for child in stage_manager.children(stage.stage_id()) {
                bucket_to_partition.insert(child.fragment().id, mapping.clone());
            }
        }

        let mut output_buffer_managers = coordinator_stages_scheduler.output_buffer_managers().clone();
        for stage in &distributed_stages {
            for child in stage_manager.children(stage.stage_id()) {
                let fragment_id = child.fragment().id;
                let manager = match child.fragment().output_partitioning {
                    PartitioningHandle::FixedBroadcast => OutputBufferManager::broadcast(),
                    PartitioningHandle::ScaledWriter => OutputBufferManager::scaled(),
                    _ => {
                        let partition_count = bucket_to_partition
                            .get(&fragment_id)
                            .and_then(|mapping| mapping.as_ref())
                            .and_then(|mapping| mapping.iter().max())
                            .map(|max| max + 1)
                            .ok_or_else(|| {
                                CoordinatorError::Internal(format!(
                                    "Bucket to partition mapping is expected for fragment {}",
                                    fragment_id
                                ))
                            })?;
                        OutputBufferManager::partitioned(partition_count)
                    }
                };
                output_buffer_managers.insert(fragment_id, Arc::new(manager));
            }
        }
        let output_buffer_managers: Arc<OutputBufferManagers> = Arc::new(output_buffer_managers);

        let mut coordinator_listener = coordinator_stages_scheduler.task_lifecycle_listener();
        if session.settings().retry_policy != RetryPolicy::None {
            let bridge = Arc::new(TaskLifecycleListenerBridge::new(coordinator_listener));
            coordinator_listener = bridge.clone();
            state_machine.add_state_change_listener(move |state| {
                if state == DistributedStagesSchedulerState::Finished {
                    bridge.notify_no_more_source_tasks();
                }
            });
        }

        let mut stage_executions: HashMap<StageId, Arc<StageExecution>> = HashMap::new();
        let mut ordered_executions = Vec::with_capacity(distributed_stages.len());
        for stage in &distributed_stages {
            let task_lifecycle_listener = match stage_manager.parent(stage.stage_id()) {
                Some(parent) if !parent.fragment().partitioning.is_coordinator_only() => stage_executions
                    .get(parent.stage_id())
                    .ok_or_else(|| CoordinatorError::Internal(format!("No execution for stage {}", parent.stage_id())))?
                    .task_lifecycle_listener(),
                // output read by the coordinator
                _ => coordinator_listener.clone(),
            };
            let execution = StageExecution::create(
                stage.clone(),
                attempt,
                output_buffer_managers.clone(),
                task_lifecycle_listener,
                services.failure_detector.clone(),
                bucket_to_partition.get(&stage.fragment().id).cloned().flatten(),
                query_state_machine.executor().clone(),
            )?;
            stage_executions.insert(stage.stage_id().clone(), execution.clone());
            ordered_executions.push(execution);
        }

        let mut stage_schedulers = HashMap::new();
        for execution in &ordered_executions {
            let children = child_executions(stage_manager, &stage_executions, execution.stage_id())?;
            let scheduler = create_stage_scheduler(
                query_state_machine,
                execution,
                children,
                &mut partitioning_cache,
                services,
            )?;
            stage_schedulers.insert(execution.stage_id().clone(), scheduler);
        }

        let execution_schedule = services
            .execution_policy
            .create_execution_schedule(ordered_executions);
        let scheduler = Arc::new(Self {
            state_machine,
            query_state_machine: query_state_machine.clone(),
            scheduler_stats: services.scheduler_stats.clone(),
            stage_executions,
            work: Mutex::new(Some(SchedulingWork {
                execution_schedule,
                stage_schedulers,
            })),
        });
        scheduler.initialize(stage_manager, services)?;
        Ok(scheduler)
    }

    fn initialize(self: &Arc<Self>, stage_manager: &StageManager, services: &SchedulerServices) -> Result<()> {
        for execution in self.stage_executions.values() {
            let children = child_executions(stage_manager, &self.stage_executions, execution.stage_id())?;
            if children.is_empty() {
                continue;
            }
            execution.add_state_change_listener(move |state| {
                if state == StageExecutionState::Flushing || state.is_done() {
                    for child in &children {
                        child.cancel();
                    }
                }
            });
        }

        let finished_stages = Arc::new(Mutex::new(HashSet::new()));
        let stage_count = self.stage_executions.len();
        for execution in self.stage_executions.values() {
            let scheduler = Arc::downgrade(self);
            let weak_execution = Arc::downgrade(execution);
            let stage_id = execution.stage_id().clone();
            let dynamic_filter_service = services.dynamic_filter_service.clone();
            let finished_stages = finished_stages.clone();
            execution.add_state_change_listener(move |state| {
                let (Some(scheduler), Some(execution)) = (scheduler.upgrade(), weak_execution.upgrade()) else {
                    return;
                };
                if scheduler.state_machine.state().is_done() {
                    return;
                }
                if !state.can_schedule_more_tasks() {
                    dynamic_filter_service.stage_cannot_schedule_more_tasks(
                        &stage_id,
                        execution.attempt_id(),
                        execution.all_tasks().len(),
                    );
                }
                if state == StageExecutionState::Failed {
                    let cause = execution.failure_cause().unwrap_or_else(|| {
                        ExecutionFailure::internal(format!(
                            "Stage execution for stage {} failed but failure cause is not present",
                            stage_id
                        ))
                    });
                    scheduler.fail(cause, Some(stage_id.clone()));
                } else if state.is_done() {
                    let all_finished = {
                        let mut finished_stages = finished_stages.lock();
                        finished_stages.insert(stage_id.clone());
                        finished_stages.len() == stage_count
                    };
                    if all_finished {
                        scheduler.state_machine.transition_to_finished();
                    }
                }
            });
        }
        Ok(())
    }

    pub(super) fn state_machine(&self) -> &DistributedStagesSchedulerStateMachine {
        &self.state_machine
    }

    pub fn stage_execution(&self, stage_id: &StageId) -> Option<&Arc<StageExecution>> {
        self.stage_executions.get(stage_id)
    }

    pub async fn schedule(&self) {
        let Some(mut work) = self.work.lock().take() else {
            warn!(query_id = %self.query_state_machine.query_id(), "Pipelined scheduling already started");
            return;
        };

        if let Err(error) = self.schedule_stages(&mut work).await {
            self.fail(error.into(), None);
        }

        let mut close_failures = Vec::new();
        for (stage_id, stage_scheduler) in work.stage_schedulers.iter_mut() {
            if let Err(error) = stage_scheduler.close() {
                error!(stage_id = %stage_id, "Failed to close stage scheduler: {}", error);
                close_failures.push(error);
            }
        }
        if let Err(error) = combine_failures(close_failures) {
            self.fail(error.into(), None);
        }
    }

    async fn schedule_stages(&self, work: &mut SchedulingWork) -> Result<()> {
        for stage_scheduler in work.stage_schedulers.values_mut() {
            stage_scheduler.start();
        }

        while !work.execution_schedule.is_finished() {
            if self.state_machine.state().is_done() {
                return Ok(());
            }
            let StagesScheduleResult {
                stages_to_schedule,
                reschedule,
            } = work.execution_schedule.stages_to_schedule();
            let mut blocked_stages = Vec::new();
            for execution in stages_to_schedule {
                execution.begin_scheduling();

                let stage_scheduler = work.stage_schedulers.get_mut(execution.stage_id()).ok_or_else(|| {
                    CoordinatorError::Internal(format!("No scheduler for stage {}", execution.stage_id()))
                })?;
                let result = stage_scheduler.schedule()?;

                if self.state_machine.state() == DistributedStagesSchedulerState::Planned
                    && !execution.all_tasks().is_empty()
                {
                    self.state_machine.transition_to_running();
                }

                if result.is_finished() {
                    execution.scheduling_complete();
                } else if !unblock::is_done(result.blocked_future()) {
                    blocked_stages.push(result.blocked_future().clone());
                }

                self.scheduler_stats.record_splits_scheduled(result.splits_scheduled());
                match result.blocked_reason() {
                    Some(BlockedReason::WaitingForSource) => self.scheduler_stats.record_waiting_for_source(),
                    Some(BlockedReason::SplitQueuesFull) => self.scheduler_stats.record_split_queues_full(),
                    // no statistic is kept for writer scaling
                    Some(BlockedReason::WriterScaling) | None => {}
                }
            }

            if blocked_stages.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }
            // a reschedule lets stages that became ready start before the blocked ones resume
            blocked_stages.extend(reschedule);
            let started = Instant::now();
            unblock::wait_any(blocked_stages, BLOCKED_WAIT).await;
            self.scheduler_stats.record_sleep_time(started.elapsed());
        }

        for execution in self.stage_executions.values() {
            let state = execution.state();
            verify(
                matches!(
                    state,
                    StageExecutionState::Scheduled | StageExecutionState::Running | StageExecutionState::Flushing
                ) || state.is_done(),
                || {
                    format!(
                        "Scheduling is complete, but stage {} is in state {:?}",
                        execution.stage_id(),
                        state
                    )
                },
            )?;
        }
        Ok(())
    }

    pub fn cancel_stage(&self, stage_id: &StageId) {
        if let Some(execution) = self.stage_executions.get(stage_id) {
            execution.cancel();
        }
    }

    pub fn cancel(&self) {
        self.state_machine.transition_to_canceled();
        for execution in self.stage_executions.values() {
            execution.cancel();
        }
    }

    pub fn abort(&self) {
        self.state_machine.transition_to_aborted();
        for execution in self.stage_executions.values() {
            execution.abort();
        }
    }

    fn fail(&self, cause: ExecutionFailure, failed_stage_id: Option<StageId>) {
        self.state_machine.transition_to_failed(cause, failed_stage_id);
        for execution in self.stage_executions.values() {
            execution.abort();
        }
    }

    /// Fails the whole attempt on behalf of a task of this attempt. Unknown
    /// tasks are ignored.
    pub fn report_task_failure(&self, task_id: &TaskId, failure: ExecutionFailure) {
        let Some(execution) = self.stage_executions.get(task_id.stage_id()) else {
            return;
        };
        if execution.find_task(task_id).is_none() {
            return;
        }
        if let Err(error) = execution.fail_task(task_id, failure.clone()) {
            debug!(task_id = %task_id, "Failed to fail task: {}", error);
        }
        self.state_machine
            .transition_to_failed(failure, Some(task_id.stage_id().clone()));
        for execution in self.stage_executions.values() {
            execution.abort();
        }
    }
}

fn child_executions(
    stage_manager: &StageManager,
    stage_executions: &HashMap<StageId, Arc<StageExecution>>,
    stage_id: &StageId,
) -> Result<Vec<Arc<StageExecution>>> {
    stage_manager
        .children(stage_id)
        .iter()
        .map(|child| {
            stage_executions
                .get(child.stage_id())
                .cloned()
                .ok_or_else(|| CoordinatorError::Internal(format!("No execution for stage {}", child.stage_id())))
        })
        .collect()
}

fn no_nodes_available() -> CoordinatorError {
    ExecutionFailure::new(ErrorCode::NO_NODES_AVAILABLE, "No worker nodes available").into()
}

/// How the output of the children of a stage with this fragment is bucketed.
fn stage_bucket_to_partition(
    fragment: &PlanFragment,
    partitioning_cache: &mut PartitioningCache,
) -> Result<Option<Vec<u32>>> {
    if matches!(
        fragment.partitioning,
        PartitioningHandle::Source | PartitioningHandle::ScaledWriter
    ) {
        return Ok(Some(vec![0]));
    }
    if fragment.has_table_scan() {
        if fragment.all_remote_sources_replicated() {
            return Ok(None);
        }
        let map = partitioning_cache.get(&fragment.partitioning)?;
        return Ok(Some(map.bucket_to_partition().to_vec()));
    }
    let map = partitioning_cache.get(&fragment.partitioning)?;
    if map.partition_to_node().is_empty() {
        return Err(no_nodes_available());
    }
    Ok(Some(map.bucket_to_partition().to_vec()))
}

fn create_stage_scheduler(
    query_state_machine: &Arc<QueryStateMachine>,
    execution: &Arc<StageExecution>,
    children: Vec<Arc<StageExecution>>,
    partitioning_cache: &mut PartitioningCache,
    services: &SchedulerServices,
) -> Result<Box<dyn StageScheduler>> {
    let session = query_state_machine.session();
    let settings = session.settings();
    let fragment = execution.fragment().clone();
    let split_sources = services.split_source_factory.create_split_sources(session, &fragment)?;
    if !split_sources.is_empty() {
        let sources = Mutex::new(Some(split_sources.values().cloned().collect::<Vec<_>>()));
        query_state_machine.add_state_change_listener(move |state| {
            if state.is_done() {
                if let Some(sources) = sources.lock().take() {
                    close_split_sources(sources);
                }
            }
        });
    }

    match &fragment.partitioning {
        PartitioningHandle::Source => {
            verify(split_sources.len() == 1, || {
                format!(
                    "Source distributed stage {} expects one split source, got {}",
                    execution.stage_id(),
                    split_sources.len()
                )
            })?;
            let Some((plan_node_id, split_source)) = split_sources.into_iter().next() else {
                return Err(CoordinatorError::Internal(format!(
                    "No split source for stage {}",
                    execution.stage_id()
                )));
            };
            let catalog = Some(split_source.catalog_handle()).filter(|catalog| !catalog.is_internal());
            let node_selector = services.node_scheduler.create_node_selector(session, catalog);
            let placement_policy = Box::new(DynamicSplitPlacementPolicy::new(node_selector.clone(), execution.clone()));
            let source_stages = children;
            Ok(Box::new(
                SourcePartitionedScheduler::with_task_creation(
                    execution.clone(),
                    plan_node_id,
                    split_source,
                    placement_policy,
                    node_selector,
                    settings.split_batch_size,
                )
                .with_source_task_backpressure(Box::new(move || {
                    source_stages.iter().any(|stage| stage.is_any_task_blocked())
                })),
            ))
        }
        PartitioningHandle::ScaledWriter => {
            let source_stages = children.clone();
            let source_tasks: TaskStatusProvider = Box::new(move || {
                source_stages
                    .iter()
                    .flat_map(|stage| stage.task_statuses())
                    .collect()
            });
            let writer_stage = execution.clone();
            let writer_tasks: TaskStatusProvider = Box::new(move || writer_stage.task_statuses());
            let scheduler = ScaledWriterScheduler::new(
                execution.clone(),
                source_tasks,
                writer_tasks,
                services.node_scheduler.create_node_selector(session, None),
                settings.writer_min_size_bytes,
                settings.scaled_writer_recheck_interval(),
            );
            finish_when_all_done(&children, scheduler.finish_flag());
            Ok(Box::new(scheduler))
        }
        partitioning if split_sources.is_empty() => {
            // every input is remote
            let map = partitioning_cache.get(partitioning)?;
            if map.partition_to_node().is_empty() {
                return Err(no_nodes_available());
            }
            Ok(Box::new(FixedCountScheduler::new(
                execution.clone(),
                map.partition_to_node().to_vec(),
            )))
        }
        partitioning => {
            let catalog = partitioning.catalog_handle().ok_or_else(|| {
                CoordinatorError::Internal(format!("No catalog for partitioning {:?}", partitioning))
            })?;
            let (bucket_node_map, nodes) = if fragment.all_remote_sources_replicated() {
                let bucket_node_map = services
                    .node_partitioning_manager
                    .bucket_node_map(session, partitioning)?;
                let mut nodes = services
                    .node_scheduler
                    .create_node_selector(session, Some(catalog))
                    .all_nodes();
                nodes.shuffle(&mut rand::thread_rng());
                (bucket_node_map, nodes)
            } else {
                let map = partitioning_cache.get(partitioning)?;
                (map.as_bucket_node_map(), map.partition_to_node().to_vec())
            };
            Ok(Box::new(FixedSourcePartitionedScheduler::new(
                execution.clone(),
                split_sources,
                &fragment.partitioned_sources,
                nodes,
                bucket_node_map,
                settings.split_batch_size,
            )?))
        }
    }
}

/// Sets `flag` once every stage in `stages` is done.
fn finish_when_all_done(stages: &[Arc<StageExecution>], flag: Arc<AtomicBool>) {
    if stages.is_empty() {
        flag.store(true, Ordering::SeqCst);
        return;
    }
    let remaining: Arc<Mutex<HashSet<StageId>>> =
        Arc::new(Mutex::new(stages.iter().map(|stage| stage.stage_id().clone()).collect()));
    for stage in stages {
        let remaining = remaining.clone();
        let flag = flag.clone();
        let stage_id = stage.stage_id().clone();
        stage.add_state_change_listener(move |state| {
            if !state.is_done() {
                return;
            }
            let mut remaining = remaining.lock();
            if remaining.remove(&stage_id) && remaining.is_empty() {
                flag.store(true, Ordering::SeqCst);
            }
        });
    }
}

fn close_split_sources(sources: Vec<Arc<dyn SplitSource>>) {
    for source in sources {
        if let Err(error) = source.close() {
            warn!("Error closing split source: {}", error);
        }
    }
}
