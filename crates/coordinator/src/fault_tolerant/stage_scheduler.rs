use super::memory::PartitionMemoryEstimator;
use super::node_allocator::{MemoryRequirements, NodeAllocator, NodeLease};
use super::partitioning::BucketToPartition;
use super::task_source::{TaskDescriptorStorage, TaskDescriptorsFuture, TaskSource, TaskSourceFactory};
use crate::error::{CoordinatorError, Result};
use crate::exchange::{Exchange, ExchangeSinkHandle};
use crate::node::{FailureDetector, InternalNode};
use crate::output_buffers::OutputBuffers;
use crate::query::Session;
use crate::stage::SqlStage;
use crate::task::{task_failure_cause, RemoteTask, TaskState, TaskStatus};
use crate::unblock::{self, Signal, UnblockFuture};
use futures::future::{FutureExt, Shared};
use igloo_common::{ErrorCode, ExecutionFailure, PlanFragmentId, StageId, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Re-attempt limits: a cap per task partition plus a budget shared by
/// every stage of the query.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    remaining_overall: Arc<AtomicU32>,
    max_per_task: u32,
}

impl RetryBudget {
    pub fn new(overall: u32, max_per_task: u32) -> Self {
        Self {
            remaining_overall: Arc::new(AtomicU32::new(overall)),
            max_per_task,
        }
    }

    pub fn remaining_overall(&self) -> u32 {
        self.remaining_overall.load(Ordering::SeqCst)
    }

    pub fn max_per_task(&self) -> u32 {
        self.max_per_task
    }

    fn try_consume(&self) -> bool {
        self.remaining_overall
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok()
    }
}

struct PartitionState {
    sink: ExchangeSinkHandle,
    memory: MemoryRequirements,
    next_attempt: u32,
    retries: u32,
    finished: bool,
}

struct PendingTask {
    partition: u32,
    lease: Arc<dyn NodeLease>,
}

struct RunningTask {
    task: Arc<dyn RemoteTask>,
    lease: Arc<dyn NodeLease>,
    sink: ExchangeSinkHandle,
    memory: MemoryRequirements,
}

#[derive(Default)]
struct SchedulerState {
    task_source: Option<Box<dyn TaskSource>>,
    more_tasks: Option<Shared<TaskDescriptorsFuture>>,
    partitions: HashMap<u32, PartitionState>,
    queued_partitions: VecDeque<u32>,
    pending_tasks: Vec<PendingTask>,
    running_tasks: HashMap<TaskId, RunningTask>,
    no_more_sinks: bool,
    failure: Option<ExecutionFailure>,
    closed: bool,
}

impl SchedulerState {
    fn task_source_finished(&self) -> bool {
        self.task_source.as_ref().map(|source| source.is_finished()).unwrap_or(false)
    }
}

/// Collaborators shared by the stage schedulers of one query.
#[derive(Clone)]
pub struct FaultTolerantSchedulingContext {
    pub session: Session,
    pub failure_detector: Arc<dyn FailureDetector>,
    pub node_allocator: Arc<dyn NodeAllocator>,
    pub task_descriptor_storage: Arc<TaskDescriptorStorage>,
    pub task_source_factory: Arc<dyn TaskSourceFactory>,
    pub retry_budget: RetryBudget,
}

/// Runs the task partitions of one stage, re-running failed partitions
/// within the retry budget. Task output is spooled into `sink_exchange`.
pub struct FaultTolerantStageScheduler {
    context: FaultTolerantSchedulingContext,
    stage: Arc<SqlStage>,
    memory_estimator: Box<dyn PartitionMemoryEstimator>,
    sink_exchange: Arc<dyn Exchange>,
    sink_partition_count: u32,
    source_exchanges: HashMap<PlanFragmentId, Arc<dyn Exchange>>,
    input_partitioning: BucketToPartition,
    state: Mutex<SchedulerState>,
    wakeup: Signal,
    self_ref: Weak<FaultTolerantStageScheduler>,
}

impl FaultTolerantStageScheduler {
    pub fn new(
        context: FaultTolerantSchedulingContext,
        stage: Arc<SqlStage>,
        memory_estimator: Box<dyn PartitionMemoryEstimator>,
        sink_exchange: Arc<dyn Exchange>,
        sink_bucket_to_partition: Option<&[u32]>,
        source_exchanges: HashMap<PlanFragmentId, Arc<dyn Exchange>>,
        input_partitioning: BucketToPartition,
    ) -> Arc<Self> {
        let sink_partition_count = sink_bucket_to_partition
            .and_then(|buckets| buckets.iter().max())
            .map(|max| max + 1)
            .unwrap_or(1);
        Arc::new_cyclic(|self_ref| Self {
            context,
            stage,
            memory_estimator,
            sink_exchange,
            sink_partition_count,
            source_exchanges,
            input_partitioning,
            state: Mutex::new(SchedulerState::default()),
            wakeup: Signal::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn stage_id(&self) -> &StageId {
        self.stage.stage_id()
    }

    pub fn sink_exchange(&self) -> &Arc<dyn Exchange> {
        &self.sink_exchange
    }

    /// One scheduling step: load task descriptors, request nodes and start
    /// tasks on the nodes granted so far. Fails once a task failure can no
    /// longer be retried.
    pub fn schedule(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.clone().into());
        }
        if state.closed {
            return Ok(());
        }
        if state.task_source.is_none() {
            let task_source = self.context.task_source_factory.create(
                &self.context.session,
                self.stage.fragment(),
                &self.source_exchanges,
                self.input_partitioning.bucket_to_partition.as_deref(),
                self.input_partitioning.bucket_node_map.as_ref(),
            )?;
            state.task_source = Some(task_source);
        }
        self.load_more_tasks(&mut state)?;
        self.acquire_nodes(&mut state)?;
        self.start_acquired_tasks(&mut state)
    }

    pub fn is_blocked(&self) -> UnblockFuture {
        let state = self.state.lock();
        if state.failure.is_some() || state.closed || state.task_source.is_none() {
            return unblock::immediate();
        }
        if self.can_make_progress(&state) {
            return unblock::immediate();
        }
        let mut futures = vec![self.wakeup.future()];
        if let Some(more_tasks) = &state.more_tasks {
            futures.push(unblock::from_future(more_tasks.clone()));
        }
        for pending in &state.pending_tasks {
            futures.push(pending.lease.acquired());
        }
        unblock::any(futures)
    }

    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.failure.is_none()
            && state.task_source_finished()
            && state.more_tasks.is_none()
            && state.queued_partitions.is_empty()
            && state.pending_tasks.is_empty()
            && state.running_tasks.is_empty()
            && state.partitions.values().all(|partition| partition.finished)
    }

    pub fn cancel(&self) {
        self.close(false);
    }

    pub fn abort(&self) {
        self.close(true);
    }

    fn can_make_progress(&self, state: &SchedulerState) -> bool {
        let more_tasks_ready = match &state.more_tasks {
            Some(more_tasks) => more_tasks.clone().now_or_never().is_some(),
            None => !state.task_source_finished(),
        };
        more_tasks_ready
            || (!state.queued_partitions.is_empty()
                && state.pending_tasks.len() < self.context.session.settings().max_tasks_waiting_for_node_per_stage)
            || state.pending_tasks.iter().any(|pending| pending.lease.node().is_some())
    }

    fn load_more_tasks(&self, state: &mut SchedulerState) -> Result<()> {
        if state.more_tasks.is_none() {
            let Some(task_source) = state.task_source.as_mut() else {
                return Ok(());
            };
            if task_source.is_finished() {
                self.seal_sinks(state);
                return Ok(());
            }
            state.more_tasks = Some(task_source.more_tasks().shared());
        }
        let Some(result) = state.more_tasks.as_ref().and_then(|more_tasks| more_tasks.clone().now_or_never()) else {
            return Ok(());
        };
        state.more_tasks = None;

        let settings = self.context.session.settings();
        for descriptor in result? {
            let partition = descriptor.partition_id;
            if state.partitions.contains_key(&partition) {
                return Err(CoordinatorError::Internal(format!(
                    "Partition {} of stage {} was produced twice",
                    partition,
                    self.stage_id()
                )));
            }
            self.context.task_descriptor_storage.put(self.stage_id(), descriptor)?;
            let sink = self.sink_exchange.add_sink(partition);
            let memory = self
                .memory_estimator
                .initial_memory_requirements(&self.context.session, settings.initial_task_memory_bytes);
            state.partitions.insert(
                partition,
                PartitionState {
                    sink,
                    memory,
                    next_attempt: 0,
                    retries: 0,
                    finished: false,
                },
            );
            state.queued_partitions.push_back(partition);
        }
        if state.task_source_finished() {
            self.seal_sinks(state);
        }
        Ok(())
    }

    fn seal_sinks(&self, state: &mut SchedulerState) {
        if !state.no_more_sinks {
            state.no_more_sinks = true;
            self.sink_exchange.no_more_sinks();
        }
    }

    fn acquire_nodes(&self, state: &mut SchedulerState) -> Result<()> {
        let max_waiting = self.context.session.settings().max_tasks_waiting_for_node_per_stage;
        while state.pending_tasks.len() < max_waiting {
            let Some(partition) = state.queued_partitions.pop_front() else {
                break;
            };
            let Some(partition_state) = state.partitions.get(&partition) else {
                continue;
            };
            let descriptor = self
                .context
                .task_descriptor_storage
                .get(self.stage_id(), partition)
                .ok_or_else(|| {
                    CoordinatorError::Internal(format!(
                        "Missing task descriptor for partition {} of stage {}",
                        partition,
                        self.stage_id()
                    ))
                })?;
            let lease = self
                .context
                .node_allocator
                .acquire(descriptor.node_requirements, partition_state.memory);
            state.pending_tasks.push(PendingTask { partition, lease });
        }
        Ok(())
    }

    fn start_acquired_tasks(&self, state: &mut SchedulerState) -> Result<()> {
        let mut pending = std::mem::take(&mut state.pending_tasks).into_iter();
        while let Some(pending_task) = pending.next() {
            let Some(node) = pending_task.lease.node() else {
                state.pending_tasks.push(pending_task);
                continue;
            };
            if let Err(error) = self.start_task(state, pending_task.partition, pending_task.lease.clone(), &node) {
                pending_task.lease.release();
                state.pending_tasks.extend(pending);
                return Err(error);
            }
        }
        Ok(())
    }

    fn start_task(
        &self,
        state: &mut SchedulerState,
        partition: u32,
        lease: Arc<dyn NodeLease>,
        node: &InternalNode,
    ) -> Result<()> {
        let descriptor = self
            .context
            .task_descriptor_storage
            .get(self.stage_id(), partition)
            .ok_or_else(|| {
                CoordinatorError::Internal(format!(
                    "Missing task descriptor for partition {} of stage {}",
                    partition,
                    self.stage_id()
                ))
            })?;
        let partition_state = state.partitions.get_mut(&partition).ok_or_else(|| {
            CoordinatorError::Internal(format!("Unknown partition {} of stage {}", partition, self.stage_id()))
        })?;
        let attempt = partition_state.next_attempt;
        partition_state.next_attempt += 1;
        let sink = partition_state.sink.clone();
        let memory = partition_state.memory;

        let output_buffers = OutputBuffers::Spooling {
            version: 0,
            sink: self.sink_exchange.instantiate_sink(&sink, attempt),
            output_partition_count: self.sink_partition_count,
        };
        let Some(task) = self
            .stage
            .create_task(node, partition, attempt, descriptor.splits, output_buffers)
        else {
            lease.release();
            return Ok(());
        };

        // every input of a task is known when it starts
        let fragment = self.stage.fragment();
        for plan_node_id in fragment
            .partitioned_sources
            .iter()
            .chain(fragment.remote_source_nodes.iter().map(|remote_source| &remote_source.id))
        {
            task.no_more_splits(plan_node_id);
        }

        let scheduler = self.self_ref.clone();
        task.add_state_change_listener(Arc::new(move |status: TaskStatus| {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.update_task_status(&status);
            }
        }));
        state.running_tasks.insert(
            task.task_id().clone(),
            RunningTask {
                task: task.clone(),
                lease,
                sink,
                memory,
            },
        );
        task.start();
        Ok(())
    }

    fn update_task_status(&self, status: &TaskStatus) {
        if !status.state.is_done() {
            return;
        }
        {
            let mut state = self.state.lock();
            let Some(running) = state.running_tasks.remove(&status.task_id) else {
                return;
            };
            running.lease.release();
            let partition = status.task_id.partition_id();
            if status.state == TaskState::Finished {
                self.memory_estimator.register_partition_finished(
                    running.memory,
                    status.peak_memory_reservation_bytes,
                    true,
                    None,
                );
                self.sink_exchange.sink_finished(&running.sink, status.task_id.attempt_id());
                if let Some(partition_state) = state.partitions.get_mut(&partition) {
                    partition_state.finished = true;
                }
                self.context.task_descriptor_storage.remove(self.stage_id(), partition);
            } else if !state.closed {
                self.handle_task_failure(&mut state, status, running.memory);
            }
        }
        self.wakeup.notify();
    }

    fn handle_task_failure(&self, state: &mut SchedulerState, status: &TaskStatus, memory: MemoryRequirements) {
        let cause = match status.state {
            TaskState::Failed => task_failure_cause(status, self.context.failure_detector.as_ref()),
            other => ExecutionFailure::internal(format!("Task {} is {:?} unexpectedly", status.task_id, other)),
        };
        let error_code = cause.error_code();
        self.memory_estimator.register_partition_finished(
            memory,
            status.peak_memory_reservation_bytes,
            false,
            error_code,
        );

        let partition = status.task_id.partition_id();
        let Some(partition_state) = state.partitions.get_mut(&partition) else {
            return;
        };
        if cause.is_user_error() {
            debug!("Task {} failed with a user error, not retrying", status.task_id);
            state.failure = Some(cause);
            return;
        }
        let budget = &self.context.retry_budget;
        if partition_state.retries >= budget.max_per_task() {
            warn!(
                "Task {} failed and partition {} exhausted its {} retries",
                status.task_id,
                partition,
                budget.max_per_task()
            );
            state.failure = Some(too_many_failures(
                format!("Task {} failed {} times", status.task_id, partition_state.retries + 1),
                cause,
            ));
            return;
        }
        if !budget.try_consume() {
            warn!("Task {} failed and the query has no retries left", status.task_id);
            state.failure = Some(too_many_failures(
                format!("Task {} failed and the query retry budget is exhausted", status.task_id),
                cause,
            ));
            return;
        }
        partition_state.retries += 1;
        partition_state.memory = self.memory_estimator.next_memory_requirements_after_failure(
            memory,
            status.peak_memory_reservation_bytes,
            error_code,
        );
        info!(
            "Retrying partition {} of stage {} after failure of task {}: {}",
            partition,
            self.stage_id(),
            status.task_id,
            cause
        );
        state.queued_partitions.push_back(partition);
    }

    fn close(&self, abort: bool) {
        let (running, pending, task_source) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.more_tasks = None;
            state.queued_partitions.clear();
            (
                std::mem::take(&mut state.running_tasks),
                std::mem::take(&mut state.pending_tasks),
                state.task_source.take(),
            )
        };
        for running_task in running.into_values() {
            if abort {
                running_task.task.abort();
            } else {
                running_task.task.cancel();
            }
            running_task.lease.release();
        }
        for pending_task in pending {
            pending_task.lease.release();
        }
        if let Some(mut task_source) = task_source {
            if let Err(error) = task_source.close() {
                warn!("Failed to close task source of stage {}: {}", self.stage_id(), error);
            }
        }
        if let Err(error) = self.sink_exchange.close() {
            warn!("Failed to close exchange {}: {}", self.sink_exchange.id(), error);
        }
        self.wakeup.notify();
    }
}

fn too_many_failures(message: String, cause: ExecutionFailure) -> ExecutionFailure {
    let mut failure = ExecutionFailure::new(ErrorCode::TOO_MANY_TASK_FAILURES, format!("{}: {}", message, cause));
    failure.add_suppressed(cause);
    failure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_is_shared() {
        let budget = RetryBudget::new(2, 4);
        let shared = budget.clone();
        assert!(budget.try_consume());
        assert!(shared.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(shared.remaining_overall(), 0);
        assert_eq!(shared.max_per_task(), 4);
    }
}
