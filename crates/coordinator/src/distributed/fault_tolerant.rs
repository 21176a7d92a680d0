use super::DistributedStagesSchedulerStateMachine;
use crate::coordinator_stages::CoordinatorStagesScheduler;
use crate::error::{verify, CoordinatorError, Result};
use crate::exchange::{Exchange, ExchangeContext, ExchangeId, ExchangeInput, ExchangeManager};
use crate::fault_tolerant::{
    BucketToPartitionCache, FaultTolerantSchedulingContext, FaultTolerantStageScheduler, NodeAllocator, RetryBudget,
};
use crate::query::{QueryState, QueryStateMachine};
use crate::services::SchedulerServices;
use crate::stage::StageManager;
use crate::stats::SplitSchedulerStats;
use crate::unblock::{self, UnblockFuture};
use futures::future::try_join_all;
use igloo_common::{ExecutionFailure, PlanFragmentId, StageId, TaskId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BLOCKED_WAIT: Duration = Duration::from_secs(1);

/// What one pass over the stage schedulers left behind.
#[derive(Default)]
struct SchedulingPass {
    unblocked: bool,
    blocked: Vec<UnblockFuture>,
}

impl SchedulingPass {
    /// Records the blocked future of a stage as observed after its turn.
    fn record(&mut self, blocked: UnblockFuture) {
        if unblock::is_done(&blocked) {
            self.unblocked = true;
        } else {
            self.blocked.push(blocked);
        }
    }

    fn must_wait(&self) -> bool {
        !self.unblocked && !self.blocked.is_empty()
    }
}

/// Spools the output of every stage into an exchange so that individual
/// task partitions can be re-run after a failure.
pub struct FaultTolerantDistributedStagesScheduler {
    state_machine: DistributedStagesSchedulerStateMachine,
    query_state_machine: Arc<QueryStateMachine>,
    stage_manager: Arc<StageManager>,
    scheduler_stats: Arc<SplitSchedulerStats>,
    // children before parents
    stage_schedulers: Vec<Arc<FaultTolerantStageScheduler>>,
    node_allocator: Arc<dyn NodeAllocator>,
    started: AtomicBool,
}

struct StageSchedulers {
    schedulers: Vec<Arc<FaultTolerantStageScheduler>>,
    exchanges: Vec<Arc<dyn Exchange>>,
    coordinator_consumed: Vec<Arc<dyn Exchange>>,
}

impl FaultTolerantDistributedStagesScheduler {
    pub fn create(
        query_state_machine: &Arc<QueryStateMachine>,
        stage_manager: &Arc<StageManager>,
        coordinator_stages_scheduler: &Arc<CoordinatorStagesScheduler>,
        services: &SchedulerServices,
        exchange_manager: Arc<dyn ExchangeManager>,
    ) -> Result<Arc<Self>> {
        let session = query_state_machine.session().clone();
        let query_id = session.query_id().clone();

        let task_descriptor_storage = services.task_descriptor_storage.clone();
        task_descriptor_storage.initialize(&query_id);
        {
            let storage = task_descriptor_storage.clone();
            let query_id = query_id.clone();
            query_state_machine.add_state_change_listener(move |state| {
                if state.is_done() {
                    storage.destroy(&query_id);
                }
            });
        }

        let settings = session.settings();
        let node_allocator = services.node_allocator_service.node_allocator(&session);
        let context = FaultTolerantSchedulingContext {
            session: session.clone(),
            failure_detector: services.failure_detector.clone(),
            node_allocator: node_allocator.clone(),
            task_descriptor_storage,
            task_source_factory: services.task_source_factory.clone(),
            retry_budget: RetryBudget::new(settings.task_retry_attempts_overall, settings.task_retry_attempts_per_task),
        };
        let mut bucket_to_partition_cache = BucketToPartitionCache::new(
            session.clone(),
            services.node_partitioning_manager.clone(),
            settings.fault_tolerant_execution_partition_count,
        );

        let mut created = StageSchedulers {
            schedulers: Vec::new(),
            exchanges: Vec::new(),
            coordinator_consumed: Vec::new(),
        };
        if let Err(error) = create_stage_schedulers(
            stage_manager,
            &context,
            &mut bucket_to_partition_cache,
            services,
            exchange_manager.as_ref(),
            &mut created,
        ) {
            let mut failure = ExecutionFailure::from(error);
            for scheduler in &created.schedulers {
                scheduler.abort();
            }
            if let Err(close_error) = node_allocator.close() {
                failure.add_suppressed(close_error.into());
            }
            for exchange in &created.exchanges {
                if let Err(close_error) = exchange.close() {
                    failure.add_suppressed(close_error.into());
                }
            }
            return Err(failure.into());
        }

        if !created.schedulers.is_empty() {
            verify(!created.coordinator_consumed.is_empty(), || {
                "No exchange is read by the coordinator".to_string()
            })?;
            let handles = try_join_all(
                created
                    .coordinator_consumed
                    .iter()
                    .map(|exchange| exchange.source_handles()),
            );
            let coordinator = coordinator_stages_scheduler.clone();
            let query = query_state_machine.clone();
            query_state_machine.executor().spawn(async move {
                match handles.await {
                    Ok(handles) => {
                        let source_handles: Vec<_> = handles.into_iter().flatten().collect();
                        let inputs = if source_handles.is_empty() {
                            Vec::new()
                        } else {
                            vec![ExchangeInput::Spooling { source_handles }]
                        };
                        if let Err(error) = coordinator.set_spooling_exchange_inputs(inputs) {
                            query.transition_to_failed(error.into());
                        }
                    }
                    Err(failure) => {
                        // the failure reaches the query through the stage that produced it
                        debug!(query_id = %query.query_id(), "Failed to collect exchange source handles: {}", failure);
                    }
                }
            });
        }

        Ok(Arc::new(Self {
            state_machine: DistributedStagesSchedulerStateMachine::new(
                query_id,
                query_state_machine.executor().clone(),
            ),
            query_state_machine: query_state_machine.clone(),
            stage_manager: stage_manager.clone(),
            scheduler_stats: services.scheduler_stats.clone(),
            stage_schedulers: created.schedulers,
            node_allocator,
            started: AtomicBool::new(false),
        }))
    }

    pub(super) fn state_machine(&self) -> &DistributedStagesSchedulerStateMachine {
        &self.state_machine
    }

    pub async fn schedule(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(query_id = %self.query_state_machine.query_id(), "Fault tolerant scheduling already started");
            return;
        }
        if self.stage_schedulers.is_empty() {
            self.state_machine.transition_to_finished();
            return;
        }
        self.state_machine.transition_to_running();

        loop {
            let query_state = self.query_state_machine.state();
            if query_state == QueryState::Finishing || query_state.is_done() || self.state_machine.state().is_done() {
                return;
            }

            let mut all_finished = true;
            let mut pass = SchedulingPass::default();
            for scheduler in &self.stage_schedulers {
                if scheduler.is_finished() {
                    if let Some(stage) = self.stage_manager.get(scheduler.stage_id()) {
                        stage.finish();
                    }
                    continue;
                }
                all_finished = false;

                if unblock::is_done(&scheduler.is_blocked()) {
                    if let Err(error) = scheduler.schedule() {
                        self.fail(error.into(), Some(scheduler.stage_id().clone()));
                        return;
                    }
                }
                pass.record(scheduler.is_blocked());
            }

            if all_finished {
                self.state_machine.transition_to_finished();
                return;
            }
            if !pass.must_wait() {
                tokio::task::yield_now().await;
                continue;
            }
            let started = Instant::now();
            unblock::wait_any(pass.blocked, BLOCKED_WAIT).await;
            self.scheduler_stats.record_sleep_time(started.elapsed());
        }
    }

    pub fn cancel_stage(&self, _stage_id: &StageId) -> Result<()> {
        Err(CoordinatorError::Unsupported(
            "Partial cancel is not supported in fault tolerant mode".to_string(),
        ))
    }

    /// Task failures are handled by the stage schedulers themselves.
    pub fn report_task_failure(&self, _task_id: &TaskId, _failure: ExecutionFailure) -> Result<()> {
        Err(CoordinatorError::Unsupported(
            "Task failures are handled by the stage schedulers in fault tolerant mode".to_string(),
        ))
    }

    pub fn cancel(&self) {
        self.state_machine.transition_to_canceled();
        for scheduler in &self.stage_schedulers {
            scheduler.cancel();
        }
        self.close_node_allocator();
    }

    pub fn abort(&self) {
        self.state_machine.transition_to_aborted();
        self.abort_schedulers();
    }

    fn fail(&self, cause: ExecutionFailure, failed_stage_id: Option<StageId>) {
        self.state_machine.transition_to_failed(cause, failed_stage_id);
        self.abort_schedulers();
    }

    fn abort_schedulers(&self) {
        for scheduler in &self.stage_schedulers {
            scheduler.abort();
        }
        self.close_node_allocator();
    }

    fn close_node_allocator(&self) {
        if let Err(error) = self.node_allocator.close() {
            warn!(query_id = %self.query_state_machine.query_id(), "Failed to close node allocator: {}", error);
        }
    }
}

fn create_stage_schedulers(
    stage_manager: &StageManager,
    context: &FaultTolerantSchedulingContext,
    bucket_to_partition_cache: &mut BucketToPartitionCache,
    services: &SchedulerServices,
    exchange_manager: &dyn ExchangeManager,
    created: &mut StageSchedulers,
) -> Result<()> {
    let query_id = context.session.query_id().clone();
    let mut sink_exchanges: HashMap<PlanFragmentId, Arc<dyn Exchange>> = HashMap::new();
    let mut stages = stage_manager.distributed_stages_in_topological_order();
    stages.reverse();
    for stage in stages {
        let fragment = stage.fragment().clone();
        let consumed_by_coordinator = stage_manager
            .parent(stage.stage_id())
            .map(|parent| parent.fragment().partitioning.is_coordinator_only())
            .unwrap_or(true);

        let sink_bucket_to_partition = bucket_to_partition_cache
            .get(&fragment.output_partitioning)?
            .bucket_to_partition;
        let sink_partition_count = sink_bucket_to_partition
            .as_ref()
            .and_then(|buckets| buckets.iter().max())
            .map(|max| max + 1)
            .unwrap_or(1);
        let exchange = exchange_manager.create_exchange(
            ExchangeContext {
                query_id: query_id.clone(),
                exchange_id: ExchangeId::new(format!("external-exchange-{}", stage.stage_id().id())),
            },
            sink_partition_count,
            // the coordinator reads results in order
            consumed_by_coordinator,
        )?;
        created.exchanges.push(exchange.clone());
        if consumed_by_coordinator {
            created.coordinator_consumed.push(exchange.clone());
        }

        let mut source_exchanges = HashMap::new();
        for child in stage_manager.children(stage.stage_id()) {
            let child_exchange = sink_exchanges.get(&child.fragment().id).ok_or_else(|| {
                CoordinatorError::Internal(format!("No exchange for child stage {}", child.stage_id()))
            })?;
            source_exchanges.insert(child.fragment().id, child_exchange.clone());
        }
        let input_partitioning = bucket_to_partition_cache.get(&fragment.partitioning)?;

        let scheduler = FaultTolerantStageScheduler::new(
            context.clone(),
            stage.clone(),
            services
                .partition_memory_estimator_factory
                .create_partition_memory_estimator(),
            exchange.clone(),
            sink_bucket_to_partition.as_deref(),
            source_exchanges,
            input_partitioning,
        );
        created.schedulers.push(scheduler);
        sink_exchanges.insert(fragment.id, exchange);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unblock::Signal;

    #[test]
    fn test_pass_waits_only_when_every_stage_is_blocked() {
        let signal = Signal::new();

        let mut pass = SchedulingPass::default();
        pass.record(signal.future());
        pass.record(signal.future());
        assert!(pass.must_wait());
        assert_eq!(pass.blocked.len(), 2);

        pass.record(unblock::immediate());
        assert!(!pass.must_wait());

        // every stage finished
        assert!(!SchedulingPass::default().must_wait());
    }
}
