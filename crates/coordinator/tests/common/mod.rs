//! In-memory stand-ins for the services a query scheduler talks to.

#![allow(dead_code)]

use futures::future::{self, FutureExt};
use igloo_common::{CatalogHandle, ExecutionFailure, PlanFragmentId, PlanNodeId, QueryId, StageId, TaskId};
use igloo_coordinator::dynamic_filters::DynamicFilterService;
use igloo_coordinator::exchange::{
    Exchange, ExchangeContext, ExchangeId, ExchangeManager, ExchangeSinkHandle, ExchangeSinkInstanceHandle,
    ExchangeSourceHandle, SourceHandlesFuture,
};
use igloo_coordinator::execution_schedule::AllAtOnceExecutionPolicy;
use igloo_coordinator::fault_tolerant::{
    ExponentialGrowthPartitionMemoryEstimatorFactory, MemoryRequirements, NodeAllocator, NodeAllocatorService,
    NodeLease, NodeRequirements, TaskDescriptor, TaskDescriptorStorage, TaskDescriptorsFuture, TaskSource,
    TaskSourceFactory,
};
use igloo_coordinator::fragment::{PartitioningHandle, PlanFragment};
use igloo_coordinator::node::{
    BucketNodeMap, FailureDetector, InternalNode, NodeHealth, NodePartitionMap, NodePartitioningManager,
    NodeScheduler, NodeSelector, SplitPlacementResult,
};
use igloo_coordinator::output_buffers::OutputBuffers;
use igloo_coordinator::split::{Split, SplitAssignments, SplitBatch, SplitBatchFuture, SplitSource, SplitSourceFactory};
use igloo_coordinator::state_machine::StateChangeListener;
use igloo_coordinator::stats::SplitSchedulerStats;
use igloo_coordinator::task::{
    CoordinatorTaskManager, RemoteTask, RemoteTaskFactory, TaskFailureListener, TaskState, TaskStatus,
};
use igloo_coordinator::unblock::{self, UnblockFuture};
use igloo_coordinator::{Result, SchedulerServices, Session};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds or [`WAIT_TIMEOUT`] passes.
pub async fn eventually(description: &str, condition: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("Timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

pub async fn within<T>(future: impl Future<Output = T>) -> anyhow::Result<T> {
    Ok(tokio::time::timeout(WAIT_TIMEOUT, future).await?)
}

pub fn worker(index: usize) -> InternalNode {
    InternalNode::new(format!("worker-{}", index), format!("http://worker-{}:8080", index), false)
}

pub fn coordinator_node() -> InternalNode {
    InternalNode::new("coordinator", "http://coordinator:8080", true)
}

pub fn stage_id(query_id: &QueryId, id: u32) -> StageId {
    StageId::new(query_id.clone(), id)
}

// ---- tasks ----

pub struct FakeRemoteTask {
    task_id: TaskId,
    node: InternalNode,
    status: Mutex<TaskStatus>,
    listeners: Mutex<Vec<StateChangeListener<TaskStatus>>>,
    splits: Mutex<SplitAssignments>,
    no_more_splits: Mutex<HashSet<PlanNodeId>>,
    output_buffers: Mutex<OutputBuffers>,
}

impl FakeRemoteTask {
    fn new(task_id: TaskId, node: &InternalNode, initial_splits: SplitAssignments, output_buffers: OutputBuffers) -> Self {
        let location = format!("{}/v1/task/{}", node.address, task_id);
        Self {
            status: Mutex::new(TaskStatus::initial(task_id.clone(), node.clone(), location)),
            task_id,
            node: node.clone(),
            listeners: Mutex::new(Vec::new()),
            splits: Mutex::new(initial_splits),
            no_more_splits: Mutex::new(HashSet::new()),
            output_buffers: Mutex::new(output_buffers),
        }
    }

    pub fn state(&self) -> TaskState {
        self.status.lock().state
    }

    pub fn splits(&self, plan_node_id: &str) -> Vec<Split> {
        self.splits
            .lock()
            .get(&PlanNodeId::new(plan_node_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_no_more_splits(&self, plan_node_id: &str) -> bool {
        self.no_more_splits.lock().contains(&PlanNodeId::new(plan_node_id))
    }

    pub fn output_buffers(&self) -> OutputBuffers {
        self.output_buffers.lock().clone()
    }

    pub fn flush(&self) {
        self.transition(TaskState::Flushing, None);
    }

    pub fn finish(&self) {
        self.transition(TaskState::Finished, None);
    }

    pub fn set_output_buffer_overutilized(&self, overutilized: bool) {
        self.status.lock().output_buffer_overutilized = overutilized;
    }

    pub fn set_physical_written_bytes(&self, bytes: u64) {
        self.status.lock().physical_written_bytes = bytes;
    }

    pub fn fail(&self, failure: ExecutionFailure) {
        self.transition(TaskState::Failed, Some(failure));
    }

    fn transition(&self, state: TaskState, failure: Option<ExecutionFailure>) {
        let status = {
            let mut status = self.status.lock();
            if status.state.is_done() || status.state == state {
                return;
            }
            status.state = state;
            status.failure = failure;
            status.clone()
        };
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(status.clone());
        }
    }
}

impl RemoteTask for FakeRemoteTask {
    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn node(&self) -> &InternalNode {
        &self.node
    }

    fn task_status(&self) -> TaskStatus {
        self.status.lock().clone()
    }

    fn start(&self) {
        self.transition(TaskState::Running, None);
    }

    fn add_splits(&self, splits: SplitAssignments) {
        let mut current = self.splits.lock();
        for (plan_node_id, mut added) in splits {
            current.entry(plan_node_id).or_default().append(&mut added);
        }
    }

    fn no_more_splits(&self, plan_node_id: &PlanNodeId) {
        self.no_more_splits.lock().insert(plan_node_id.clone());
    }

    fn set_output_buffers(&self, output_buffers: OutputBuffers) {
        *self.output_buffers.lock() = output_buffers;
    }

    fn add_state_change_listener(&self, listener: StateChangeListener<TaskStatus>) {
        self.listeners.lock().push(listener);
    }

    fn cancel(&self) {
        self.transition(TaskState::Canceled, None);
    }

    fn abort(&self) {
        self.transition(TaskState::Aborted, None);
    }

    fn fail_locally(&self, cause: ExecutionFailure) {
        self.fail(cause);
    }

    fn fail_remotely(&self, cause: ExecutionFailure) {
        self.fail(cause);
    }
}

#[derive(Default)]
pub struct FakeRemoteTaskFactory {
    tasks: Mutex<Vec<Arc<FakeRemoteTask>>>,
}

impl FakeRemoteTaskFactory {
    pub fn tasks_of_stage(&self, stage: u32) -> Vec<Arc<FakeRemoteTask>> {
        self.tasks
            .lock()
            .iter()
            .filter(|task| task.task_id.stage_id().id() == stage)
            .cloned()
            .collect()
    }

    pub fn task(&self, stage: u32, partition: u32, attempt: u32) -> Option<Arc<FakeRemoteTask>> {
        self.tasks
            .lock()
            .iter()
            .find(|task| {
                task.task_id.stage_id().id() == stage
                    && task.task_id.partition_id() == partition
                    && task.task_id.attempt_id() == attempt
            })
            .cloned()
    }

    pub async fn wait_for_task(&self, stage: u32, partition: u32, attempt: u32) -> anyhow::Result<Arc<FakeRemoteTask>> {
        eventually(&format!("task {}.{}.{}", stage, partition, attempt), || {
            self.task(stage, partition, attempt).is_some()
        })
        .await?;
        self.task(stage, partition, attempt)
            .ok_or_else(|| anyhow::anyhow!("Task {}.{}.{} disappeared", stage, partition, attempt))
    }
}

impl RemoteTaskFactory for FakeRemoteTaskFactory {
    fn create_remote_task(
        &self,
        _session: &Session,
        task_id: TaskId,
        node: &InternalNode,
        _fragment: &Arc<PlanFragment>,
        initial_splits: SplitAssignments,
        output_buffers: OutputBuffers,
    ) -> Arc<dyn RemoteTask> {
        let task = Arc::new(FakeRemoteTask::new(task_id, node, initial_splits, output_buffers));
        self.tasks.lock().push(task.clone());
        task
    }
}

// ---- placement ----

pub struct FakeNodeSelector {
    workers: Vec<InternalNode>,
}

impl FakeNodeSelector {
    pub fn new(workers: Vec<InternalNode>) -> Self {
        Self { workers }
    }
}

impl NodeSelector for FakeNodeSelector {
    fn select_current_node(&self) -> InternalNode {
        coordinator_node()
    }

    fn all_nodes(&self) -> Vec<InternalNode> {
        self.workers.clone()
    }

    fn select_random_nodes(&self, limit: usize, exclude: &HashSet<InternalNode>) -> Vec<InternalNode> {
        self.workers
            .iter()
            .filter(|node| !exclude.contains(node))
            .take(limit)
            .cloned()
            .collect()
    }

    fn compute_assignments(&self, splits: Vec<Split>, _existing_tasks: &[Arc<dyn RemoteTask>]) -> SplitPlacementResult {
        let mut assignments: Vec<(InternalNode, Vec<Split>)> =
            self.workers.iter().map(|node| (node.clone(), Vec::new())).collect();
        for (index, split) in splits.into_iter().enumerate() {
            assignments[index % self.workers.len()].1.push(split);
        }
        assignments.retain(|(_, splits)| !splits.is_empty());
        SplitPlacementResult {
            assignments,
            unassigned: Vec::new(),
            blocked: unblock::immediate(),
        }
    }
}

pub struct FakeNodeScheduler {
    workers: Vec<InternalNode>,
}

impl NodeScheduler for FakeNodeScheduler {
    fn create_node_selector(&self, _session: &Session, _catalog: Option<&CatalogHandle>) -> Arc<dyn NodeSelector> {
        Arc::new(FakeNodeSelector {
            workers: self.workers.clone(),
        })
    }
}

pub struct FakeNodePartitioningManager {
    workers: Vec<InternalNode>,
}

impl NodePartitioningManager for FakeNodePartitioningManager {
    fn node_partitioning_map(&self, _session: &Session, _partitioning: &PartitioningHandle) -> Result<NodePartitionMap> {
        Ok(NodePartitionMap::for_nodes(self.workers.clone()))
    }

    fn bucket_node_map(&self, _session: &Session, _partitioning: &PartitioningHandle) -> Result<BucketNodeMap> {
        Ok(BucketNodeMap::new(self.workers.clone()))
    }
}

pub struct AlwaysAlive;

impl FailureDetector for AlwaysAlive {
    fn node_health(&self, _node: &InternalNode) -> NodeHealth {
        NodeHealth::Alive
    }
}

// ---- fault tolerant execution ----

struct FakeLease {
    node: InternalNode,
    released: AtomicBool,
    release_count: Arc<AtomicUsize>,
}

impl NodeLease for FakeLease {
    fn node(&self) -> Option<InternalNode> {
        Some(self.node.clone())
    }

    fn acquired(&self) -> UnblockFuture {
        unblock::immediate()
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.release_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Grants every request right away, round robin over the workers.
pub struct FakeNodeAllocator {
    workers: Vec<InternalNode>,
    next: AtomicUsize,
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
    pub closed: AtomicBool,
}

impl NodeAllocator for FakeNodeAllocator {
    fn acquire(&self, _requirements: NodeRequirements, _memory: MemoryRequirements) -> Arc<dyn NodeLease> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let index = self.next.fetch_add(1, Ordering::SeqCst) % self.workers.len();
        Arc::new(FakeLease {
            node: self.workers[index].clone(),
            released: AtomicBool::new(false),
            release_count: self.released.clone(),
        })
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeNodeAllocatorService {
    pub allocator: Arc<FakeNodeAllocator>,
}

impl NodeAllocatorService for FakeNodeAllocatorService {
    fn node_allocator(&self, _session: &Session) -> Arc<dyn NodeAllocator> {
        self.allocator.clone()
    }
}

struct FakeTaskSource {
    descriptors: Option<Vec<TaskDescriptor>>,
}

impl TaskSource for FakeTaskSource {
    fn more_tasks(&mut self) -> TaskDescriptorsFuture {
        let descriptors = self.descriptors.take().unwrap_or_default();
        future::ready(Ok(descriptors)).boxed()
    }

    fn is_finished(&self) -> bool {
        self.descriptors.is_none()
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One descriptor per partition: single node fragments get one partition,
/// the others `partitions`.
pub struct FakeTaskSourceFactory {
    partitions: u32,
}

impl TaskSourceFactory for FakeTaskSourceFactory {
    fn create(
        &self,
        _session: &Session,
        fragment: &Arc<PlanFragment>,
        _source_exchanges: &HashMap<PlanFragmentId, Arc<dyn Exchange>>,
        _bucket_to_partition: Option<&[u32]>,
        _bucket_node_map: Option<&BucketNodeMap>,
    ) -> Result<Box<dyn TaskSource>> {
        let partitions = if fragment.partitioning.is_single_node() { 1 } else { self.partitions };
        let catalog = CatalogHandle::new("hive");
        let descriptors = (0..partitions)
            .map(|partition_id| {
                let mut splits = SplitAssignments::new();
                for plan_node_id in &fragment.partitioned_sources {
                    splits.insert(
                        plan_node_id.clone(),
                        vec![Split::connector(catalog.clone(), format!("split-{}", partition_id))],
                    );
                }
                TaskDescriptor {
                    partition_id,
                    splits,
                    node_requirements: NodeRequirements::default(),
                }
            })
            .collect();
        Ok(Box::new(FakeTaskSource {
            descriptors: Some(descriptors),
        }))
    }
}

#[derive(Default)]
struct ExchangeState {
    sinks: HashSet<u32>,
    finished: HashSet<u32>,
    no_more_sinks: bool,
}

type SourceHandlesResult = std::result::Result<Vec<ExchangeSourceHandle>, ExecutionFailure>;

pub struct FakeExchange {
    id: ExchangeId,
    pub output_partition_count: u32,
    pub preserve_order: bool,
    state: Mutex<ExchangeState>,
    handles: watch::Sender<Option<SourceHandlesResult>>,
    pub closed: AtomicBool,
}

impl FakeExchange {
    fn new(context: ExchangeContext, output_partition_count: u32, preserve_order: bool) -> Self {
        let (handles, _) = watch::channel(None);
        Self {
            id: context.exchange_id,
            output_partition_count,
            preserve_order,
            state: Mutex::new(ExchangeState::default()),
            handles,
            closed: AtomicBool::new(false),
        }
    }

    fn resolve(&self, result: SourceHandlesResult) {
        self.handles.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
    }

    fn resolve_if_complete(&self) {
        let complete = {
            let state = self.state.lock();
            state.no_more_sinks && state.sinks.iter().all(|sink| state.finished.contains(sink))
        };
        if complete {
            let handles = (0..self.output_partition_count)
                .map(|partition_id| ExchangeSourceHandle {
                    exchange_id: self.id.clone(),
                    partition_id,
                    data_size_bytes: 1024,
                })
                .collect();
            self.resolve(Ok(handles));
        }
    }
}

impl Exchange for FakeExchange {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    fn add_sink(&self, task_partition_id: u32) -> ExchangeSinkHandle {
        self.state.lock().sinks.insert(task_partition_id);
        ExchangeSinkHandle {
            exchange_id: self.id.clone(),
            task_partition_id,
        }
    }

    fn instantiate_sink(&self, sink: &ExchangeSinkHandle, attempt_id: u32) -> ExchangeSinkInstanceHandle {
        ExchangeSinkInstanceHandle {
            sink: sink.clone(),
            attempt_id,
        }
    }

    fn no_more_sinks(&self) {
        self.state.lock().no_more_sinks = true;
        self.resolve_if_complete();
    }

    fn sink_finished(&self, sink: &ExchangeSinkHandle, _attempt_id: u32) {
        self.state.lock().finished.insert(sink.task_partition_id);
        self.resolve_if_complete();
    }

    fn source_handles(&self) -> SourceHandlesFuture {
        let mut receiver = self.handles.subscribe();
        async move {
            let resolved = match receiver.wait_for(|handles| handles.is_some()).await {
                Ok(handles) => handles.clone(),
                Err(_) => None,
            };
            resolved.unwrap_or_else(|| Err(ExecutionFailure::internal("Exchange was dropped")))
        }
        .boxed()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.resolve(Err(ExecutionFailure::internal("Exchange was closed")));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExchangeManager {
    exchanges: Mutex<Vec<Arc<FakeExchange>>>,
}

impl FakeExchangeManager {
    pub fn exchange(&self, id: &str) -> Option<Arc<FakeExchange>> {
        self.exchanges
            .lock()
            .iter()
            .find(|exchange| exchange.id.as_str() == id)
            .cloned()
    }
}

impl ExchangeManager for FakeExchangeManager {
    fn create_exchange(
        &self,
        context: ExchangeContext,
        output_partition_count: u32,
        preserve_order_within_partition: bool,
    ) -> Result<Arc<dyn Exchange>> {
        let exchange = Arc::new(FakeExchange::new(
            context,
            output_partition_count,
            preserve_order_within_partition,
        ));
        self.exchanges.lock().push(exchange.clone());
        Ok(exchange)
    }
}

// ---- splits, dynamic filters and coordinator tasks ----

pub struct FakeSplitSource {
    catalog: CatalogHandle,
    batches: Mutex<VecDeque<SplitBatch>>,
    pub closed: AtomicBool,
}

impl FakeSplitSource {
    /// Hands out `batches` in order; the last one is flagged as final.
    pub fn with_batches(batches: Vec<Vec<Split>>) -> Self {
        let count = batches.len();
        Self {
            catalog: CatalogHandle::new("hive"),
            batches: Mutex::new(
                batches
                    .into_iter()
                    .enumerate()
                    .map(|(index, splits)| SplitBatch {
                        splits,
                        last_batch: index + 1 == count,
                    })
                    .collect(),
            ),
            closed: AtomicBool::new(false),
        }
    }
}

impl SplitSource for FakeSplitSource {
    fn catalog_handle(&self) -> &CatalogHandle {
        &self.catalog
    }

    fn next_batch(&self, _max_size: usize) -> SplitBatchFuture {
        let batch = self.batches.lock().pop_front().unwrap_or(SplitBatch {
            splits: Vec::new(),
            last_batch: true,
        });
        future::ready(Ok(batch)).boxed()
    }

    fn is_finished(&self) -> bool {
        self.batches.lock().is_empty()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Every table scan yields `splits_per_source` splits in a single batch.
pub struct FakeSplitSourceFactory {
    splits_per_source: usize,
    pub sources: Mutex<Vec<Arc<FakeSplitSource>>>,
}

impl SplitSourceFactory for FakeSplitSourceFactory {
    fn create_split_sources(
        &self,
        _session: &Session,
        fragment: &PlanFragment,
    ) -> Result<HashMap<PlanNodeId, Arc<dyn SplitSource>>> {
        let catalog = CatalogHandle::new("hive");
        let mut sources: HashMap<PlanNodeId, Arc<dyn SplitSource>> = HashMap::new();
        for plan_node_id in &fragment.partitioned_sources {
            let splits = (0..self.splits_per_source)
                .map(|index| Split::connector(catalog.clone(), format!("{}-{}", plan_node_id, index)))
                .collect();
            let source = Arc::new(FakeSplitSource::with_batches(vec![splits]));
            self.sources.lock().push(source.clone());
            sources.insert(plan_node_id.clone(), source);
        }
        Ok(sources)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicFilterEvent {
    StageCannotScheduleMoreTasks { stage_id: StageId, attempt_id: u32 },
    QueryRetry { attempt_id: u32 },
}

#[derive(Default)]
pub struct RecordingDynamicFilterService {
    events: Mutex<Vec<DynamicFilterEvent>>,
}

impl RecordingDynamicFilterService {
    pub fn events(&self) -> Vec<DynamicFilterEvent> {
        self.events.lock().clone()
    }
}

impl DynamicFilterService for RecordingDynamicFilterService {
    fn stage_cannot_schedule_more_tasks(&self, stage_id: &StageId, attempt_id: u32, _number_of_tasks: usize) {
        self.events.lock().push(DynamicFilterEvent::StageCannotScheduleMoreTasks {
            stage_id: stage_id.clone(),
            attempt_id,
        });
    }

    fn register_query_retry(&self, _query_id: &QueryId, attempt_id: u32) {
        self.events.lock().push(DynamicFilterEvent::QueryRetry { attempt_id });
    }
}

/// Stands in for the coordinator's local task manager: failures of upstream
/// tasks are injected with [`FakeCoordinatorTaskManager::report_source_failure`].
#[derive(Default)]
pub struct FakeCoordinatorTaskManager {
    listeners: Mutex<HashMap<TaskId, Vec<Arc<dyn TaskFailureListener>>>>,
}

impl FakeCoordinatorTaskManager {
    pub fn registered_tasks(&self) -> Vec<TaskId> {
        self.listeners.lock().keys().cloned().collect()
    }

    pub fn report_source_failure(&self, failed_task: &TaskId, failure: &ExecutionFailure) {
        let listeners: Vec<_> = self.listeners.lock().values().flatten().cloned().collect();
        for listener in listeners {
            listener.on_task_failed(failed_task, failure);
        }
    }
}

impl CoordinatorTaskManager for FakeCoordinatorTaskManager {
    fn add_source_task_failure_listener(&self, task_id: &TaskId, listener: Arc<dyn TaskFailureListener>) {
        self.listeners.lock().entry(task_id.clone()).or_default().push(listener);
    }
}

// ---- wiring ----

pub struct TestCluster {
    pub workers: Vec<InternalNode>,
    pub tasks: Arc<FakeRemoteTaskFactory>,
    pub dynamic_filters: Arc<RecordingDynamicFilterService>,
    pub split_sources: Arc<FakeSplitSourceFactory>,
    pub coordinator_tasks: Arc<FakeCoordinatorTaskManager>,
    pub node_allocator: Arc<FakeNodeAllocator>,
    pub exchanges: Arc<FakeExchangeManager>,
    pub task_descriptor_storage: Arc<TaskDescriptorStorage>,
    pub stats: Arc<SplitSchedulerStats>,
}

impl TestCluster {
    pub fn new(worker_count: usize) -> Self {
        let workers: Vec<InternalNode> = (0..worker_count).map(worker).collect();
        Self {
            tasks: Arc::new(FakeRemoteTaskFactory::default()),
            dynamic_filters: Arc::new(RecordingDynamicFilterService::default()),
            split_sources: Arc::new(FakeSplitSourceFactory {
                splits_per_source: 3,
                sources: Mutex::new(Vec::new()),
            }),
            coordinator_tasks: Arc::new(FakeCoordinatorTaskManager::default()),
            node_allocator: Arc::new(FakeNodeAllocator {
                workers: workers.clone(),
                next: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: Arc::new(AtomicUsize::new(0)),
                closed: AtomicBool::new(false),
            }),
            exchanges: Arc::new(FakeExchangeManager::default()),
            task_descriptor_storage: Arc::new(TaskDescriptorStorage::new()),
            stats: Arc::new(SplitSchedulerStats::new()),
            workers,
        }
    }

    pub fn services(&self) -> SchedulerServices {
        SchedulerServices {
            node_scheduler: Arc::new(FakeNodeScheduler {
                workers: self.workers.clone(),
            }),
            node_partitioning_manager: Arc::new(FakeNodePartitioningManager {
                workers: self.workers.clone(),
            }),
            node_allocator_service: Arc::new(FakeNodeAllocatorService {
                allocator: self.node_allocator.clone(),
            }),
            partition_memory_estimator_factory: Arc::new(ExponentialGrowthPartitionMemoryEstimatorFactory::new(
                2.0,
                1024 * 1024 * 1024,
            )),
            remote_task_factory: self.tasks.clone(),
            failure_detector: Arc::new(AlwaysAlive),
            execution_policy: Arc::new(AllAtOnceExecutionPolicy),
            dynamic_filter_service: self.dynamic_filters.clone(),
            split_source_factory: self.split_sources.clone(),
            coordinator_task_manager: self.coordinator_tasks.clone(),
            exchange_manager: Some(self.exchanges.clone()),
            task_source_factory: Arc::new(FakeTaskSourceFactory { partitions: 2 }),
            task_descriptor_storage: self.task_descriptor_storage.clone(),
            scheduler_stats: self.stats.clone(),
        }
    }
}
