mod common;

use anyhow::anyhow;
use common::{AlwaysAlive, FakeNodeSelector, FakeRemoteTask, FakeSplitSource, TestCluster};
use igloo_common::{CatalogHandle, PlanFragmentId, PlanNodeId, QueryId};
use igloo_coordinator::fragment::{PartitioningHandle, PlanFragment};
use igloo_coordinator::node::BucketNodeMap;
use igloo_coordinator::output_buffers::OutputBufferManager;
use igloo_coordinator::split::{Split, SplitAssignments, SplitSource};
use igloo_coordinator::stage::SqlStage;
use igloo_coordinator::stage_execution::OutputBufferManagers;
use igloo_coordinator::stage_scheduler::{
    BlockedReason, DynamicSplitPlacementPolicy, FixedSourcePartitionedScheduler, ScaledWriterScheduler,
    SourcePartitionedScheduler, StageScheduler,
};
use igloo_coordinator::task::{RemoteTask, TaskLifecycleListener};
use igloo_coordinator::{SchedulerSettings, Session, StageExecution};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

struct NoConsumer;

impl TaskLifecycleListener for NoConsumer {
    fn task_created(&self, _fragment_id: PlanFragmentId, _task: Arc<dyn RemoteTask>) {}

    fn no_more_tasks(&self, _fragment_id: PlanFragmentId) {}
}

fn stage_execution(cluster: &TestCluster, fragment: PlanFragment) -> anyhow::Result<Arc<StageExecution>> {
    let session = Session::new(QueryId::new("q"), SchedulerSettings::default());
    let mut managers: OutputBufferManagers = HashMap::new();
    managers.insert(fragment.id, Arc::new(OutputBufferManager::partitioned(1)));
    let stage = SqlStage::new(session, Arc::new(fragment), cluster.tasks.clone());
    Ok(StageExecution::create(
        stage,
        0,
        Arc::new(managers),
        Arc::new(NoConsumer),
        Arc::new(AlwaysAlive),
        None,
        Handle::current(),
    )?)
}

/// A stage with `count` running tasks, one per worker in turn.
fn source_stage(cluster: &TestCluster, id: u32, count: u32) -> anyhow::Result<(Arc<StageExecution>, Vec<Arc<FakeRemoteTask>>)> {
    let execution = stage_execution(
        cluster,
        PlanFragment::new(id, PartitioningHandle::FixedHash, PartitioningHandle::ScaledWriter),
    )?;
    let mut tasks = Vec::new();
    for partition in 0..count {
        let node = &cluster.workers[partition as usize % cluster.workers.len()];
        execution.schedule_task(node, partition, SplitAssignments::new())?;
        tasks.push(
            cluster
                .tasks
                .task(id, partition, 0)
                .ok_or_else(|| anyhow!("No task {}.{}", id, partition))?,
        );
    }
    Ok((execution, tasks))
}

fn split(id: &str) -> Split {
    Split::connector(CatalogHandle::new("hive"), id)
}

fn split_ids(task: &FakeRemoteTask, plan_node_id: &str) -> Vec<String> {
    task.splits(plan_node_id)
        .iter()
        .filter_map(|split| split.id().map(str::to_string))
        .collect()
}

fn scan_split_count(cluster: &TestCluster, stage: u32) -> usize {
    cluster
        .tasks
        .tasks_of_stage(stage)
        .iter()
        .map(|task| task.splits("scan").len())
        .sum()
}

fn writer_scheduler(
    cluster: &TestCluster,
    writer: &Arc<StageExecution>,
    sources: &Arc<StageExecution>,
    writer_min_size_bytes: u64,
) -> ScaledWriterScheduler {
    let source_stages = vec![sources.clone()];
    let writer_stage = writer.clone();
    ScaledWriterScheduler::new(
        writer.clone(),
        Box::new(move || source_stages.iter().flat_map(|stage| stage.task_statuses()).collect()),
        Box::new(move || writer_stage.task_statuses()),
        Arc::new(FakeNodeSelector::new(cluster.workers.clone())),
        writer_min_size_bytes,
        Duration::from_millis(10),
    )
}

fn writer_stage(cluster: &TestCluster) -> anyhow::Result<Arc<StageExecution>> {
    stage_execution(
        cluster,
        PlanFragment::new(1, PartitioningHandle::ScaledWriter, PartitioningHandle::Single),
    )
}

#[tokio::test]
async fn test_source_scheduler_holds_splits_while_source_tasks_are_blocked() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(2);
    let (build, build_tasks) = source_stage(&cluster, 2, 1)?;
    build_tasks[0].set_output_buffer_overutilized(true);

    let probe = stage_execution(
        &cluster,
        PlanFragment::new(1, PartitioningHandle::Source, PartitioningHandle::Single).with_partitioned_source("scan"),
    )?;
    let node_selector = Arc::new(FakeNodeSelector::new(cluster.workers.clone()));
    let source = Arc::new(FakeSplitSource::with_batches(vec![
        vec![split("a")],
        vec![split("b"), split("c")],
    ]));
    let source_stages = vec![build];
    let mut scheduler = SourcePartitionedScheduler::with_task_creation(
        probe.clone(),
        PlanNodeId::new("scan"),
        source,
        Box::new(DynamicSplitPlacementPolicy::new(node_selector.clone(), probe.clone())),
        node_selector,
        100,
    )
    .with_source_task_backpressure(Box::new(move || {
        source_stages.iter().any(|stage| stage.is_any_task_blocked())
    }));

    // the first task is placed even though the build side is full
    let result = scheduler.schedule()?;
    assert_eq!(result.splits_scheduled(), 1);
    assert_eq!(scan_split_count(&cluster, 1), 1);

    for _ in 0..2 {
        let result = scheduler.schedule()?;
        assert!(!result.is_finished());
        assert_eq!(result.splits_scheduled(), 0);
        assert_eq!(result.blocked_reason(), Some(BlockedReason::SplitQueuesFull));
    }
    assert_eq!(scan_split_count(&cluster, 1), 1);
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 1);

    build_tasks[0].set_output_buffer_overutilized(false);
    let result = scheduler.schedule()?;
    assert_eq!(result.splits_scheduled(), 2);
    assert_eq!(scan_split_count(&cluster, 1), 3);
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 2);

    assert!(scheduler.schedule()?.is_finished());
    for task in cluster.tasks.tasks_of_stage(1) {
        assert!(task.has_no_more_splits("scan"));
    }
    Ok(())
}

#[tokio::test]
async fn test_source_scheduler_without_backpressure_ignores_source_tasks() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(2);
    let probe = stage_execution(
        &cluster,
        PlanFragment::new(1, PartitioningHandle::Source, PartitioningHandle::Single).with_partitioned_source("scan"),
    )?;
    let node_selector = Arc::new(FakeNodeSelector::new(cluster.workers.clone()));
    let source = Arc::new(FakeSplitSource::with_batches(vec![vec![split("a")], vec![split("b")]]));
    let mut scheduler = SourcePartitionedScheduler::with_task_creation(
        probe.clone(),
        PlanNodeId::new("scan"),
        source,
        Box::new(DynamicSplitPlacementPolicy::new(node_selector.clone(), probe.clone())),
        node_selector,
        100,
    );

    assert_eq!(scheduler.schedule()?.splits_scheduled(), 1);
    assert_eq!(scheduler.schedule()?.splits_scheduled(), 1);
    assert!(scheduler.schedule()?.is_finished());
    assert_eq!(scan_split_count(&cluster, 1), 2);
    Ok(())
}

#[tokio::test]
async fn test_scaled_writer_adds_writers_while_sources_are_full() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(2);
    let (sources, source_tasks) = source_stage(&cluster, 2, 2)?;
    let writer = writer_stage(&cluster)?;
    let mut scheduler = writer_scheduler(&cluster, &writer, &sources, 100);

    let result = scheduler.schedule()?;
    assert_eq!(result.blocked_reason(), Some(BlockedReason::WriterScaling));
    assert!(!result.is_finished());
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 1);

    for task in &source_tasks {
        task.set_output_buffer_overutilized(true);
    }
    let first_writer = cluster.tasks.task(1, 0, 0).ok_or_else(|| anyhow!("No first writer"))?;
    first_writer.set_physical_written_bytes(100);
    scheduler.schedule()?;
    let writers = cluster.tasks.tasks_of_stage(1);
    assert_eq!(writers.len(), 2);
    assert_ne!(writers[0].node(), writers[1].node());

    // every node runs a writer
    first_writer.set_physical_written_bytes(1000);
    scheduler.schedule()?;
    scheduler.schedule()?;
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_scaled_writer_stays_put_below_thresholds() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(3);
    let (sources, source_tasks) = source_stage(&cluster, 2, 3)?;
    let writer = writer_stage(&cluster)?;
    let mut scheduler = writer_scheduler(&cluster, &writer, &sources, 100);
    scheduler.schedule()?;
    let first_writer = cluster.tasks.task(1, 0, 0).ok_or_else(|| anyhow!("No first writer"))?;

    // one of three source tasks is full
    source_tasks[0].set_output_buffer_overutilized(true);
    first_writer.set_physical_written_bytes(1000);
    scheduler.schedule()?;
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 1);

    // sources are full but the writer has not written enough
    for task in &source_tasks {
        task.set_output_buffer_overutilized(true);
    }
    first_writer.set_physical_written_bytes(99);
    scheduler.schedule()?;
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_scaled_writer_ignores_finished_source_tasks() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(2);
    let (sources, source_tasks) = source_stage(&cluster, 2, 3)?;
    let writer = writer_stage(&cluster)?;
    let mut scheduler = writer_scheduler(&cluster, &writer, &sources, 100);
    scheduler.schedule()?;
    cluster
        .tasks
        .task(1, 0, 0)
        .ok_or_else(|| anyhow!("No first writer"))?
        .set_physical_written_bytes(100);

    source_tasks[0].finish();
    source_tasks[1].finish();
    source_tasks[2].set_output_buffer_overutilized(true);
    scheduler.schedule()?;
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_scaled_writer_finishes_once_flagged() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(2);
    let (sources, _) = source_stage(&cluster, 2, 1)?;
    let writer = writer_stage(&cluster)?;
    let mut scheduler = writer_scheduler(&cluster, &writer, &sources, 100);
    assert!(!scheduler.schedule()?.is_finished());

    scheduler.finish_flag().store(true, Ordering::SeqCst);
    assert!(scheduler.schedule()?.is_finished());
    Ok(())
}

#[tokio::test]
async fn test_fixed_source_scheduler_routes_splits_by_bucket() -> Result<(), anyhow::Error> {
    let cluster = TestCluster::new(2);
    let stage = stage_execution(
        &cluster,
        PlanFragment::new(1, PartitioningHandle::FixedHash, PartitioningHandle::Single)
            .with_partitioned_source("left")
            .with_partitioned_source("right"),
    )?;
    let mut split_sources: HashMap<PlanNodeId, Arc<dyn SplitSource>> = HashMap::new();
    split_sources.insert(
        PlanNodeId::new("left"),
        Arc::new(FakeSplitSource::with_batches(vec![vec![
            split("l0").with_bucket(0),
            split("l1").with_bucket(1),
        ]])),
    );
    split_sources.insert(
        PlanNodeId::new("right"),
        Arc::new(FakeSplitSource::with_batches(vec![
            vec![split("r1").with_bucket(1)],
            vec![split("r0").with_bucket(0)],
        ])),
    );
    let mut scheduler = FixedSourcePartitionedScheduler::new(
        stage.clone(),
        split_sources,
        &[PlanNodeId::new("left"), PlanNodeId::new("right")],
        cluster.workers.clone(),
        BucketNodeMap::new(cluster.workers.clone()),
        100,
    )?;

    let result = scheduler.schedule()?;
    assert_eq!(result.splits_scheduled(), 2);
    assert!(!result.is_finished());
    let task0 = cluster.tasks.task(1, 0, 0).ok_or_else(|| anyhow!("No task for partition 0"))?;
    let task1 = cluster.tasks.task(1, 1, 0).ok_or_else(|| anyhow!("No task for partition 1"))?;
    assert_eq!(task0.node(), &cluster.workers[0]);
    assert_eq!(task1.node(), &cluster.workers[1]);
    assert_eq!(split_ids(&task0, "left"), vec!["l0"]);
    assert_eq!(split_ids(&task1, "left"), vec!["l1"]);

    // the left scan completes before the right one starts
    let result = scheduler.schedule()?;
    assert_eq!(result.splits_scheduled(), 1);
    assert!(task0.has_no_more_splits("left") && task1.has_no_more_splits("left"));
    assert!(!task0.has_no_more_splits("right"));
    assert_eq!(split_ids(&task1, "right"), vec!["r1"]);

    assert!(!scheduler.schedule()?.is_finished());
    assert_eq!(split_ids(&task0, "right"), vec!["r0"]);

    assert!(scheduler.schedule()?.is_finished());
    assert!(task0.has_no_more_splits("right") && task1.has_no_more_splits("right"));
    assert_eq!(cluster.tasks.tasks_of_stage(1).len(), 2);
    scheduler.close()?;
    Ok(())
}
