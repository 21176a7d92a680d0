use super::node_allocator::NodeRequirements;
use crate::error::{CoordinatorError, Result};
use crate::exchange::Exchange;
use crate::fragment::PlanFragment;
use crate::node::BucketNodeMap;
use crate::query::Session;
use crate::split::SplitAssignments;
use futures::future::BoxFuture;
use igloo_common::{ExecutionFailure, PlanFragmentId, QueryId, StageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything needed to (re)run one task partition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub partition_id: u32,
    pub splits: SplitAssignments,
    pub node_requirements: NodeRequirements,
}

pub type TaskDescriptorsFuture = BoxFuture<'static, std::result::Result<Vec<TaskDescriptor>, ExecutionFailure>>;

/// Enumerates the task partitions of a stage, batch by batch.
pub trait TaskSource: Send {
    fn more_tasks(&mut self) -> TaskDescriptorsFuture;

    fn is_finished(&self) -> bool;

    fn close(&mut self) -> Result<()>;
}

pub trait TaskSourceFactory: Send + Sync {
    fn create(
        &self,
        session: &Session,
        fragment: &Arc<PlanFragment>,
        source_exchanges: &HashMap<PlanFragmentId, Arc<dyn Exchange>>,
        bucket_to_partition: Option<&[u32]>,
        bucket_node_map: Option<&BucketNodeMap>,
    ) -> Result<Box<dyn TaskSource>>;
}

/// Keeps task descriptors of running queries so that a failed partition
/// can be re-run without enumerating its sources again.
#[derive(Default)]
pub struct TaskDescriptorStorage {
    queries: Mutex<HashMap<QueryId, HashMap<(StageId, u32), TaskDescriptor>>>,
}

impl TaskDescriptorStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&self, query_id: &QueryId) {
        self.queries.lock().entry(query_id.clone()).or_default();
    }

    pub fn put(&self, stage_id: &StageId, descriptor: TaskDescriptor) -> Result<()> {
        let mut queries = self.queries.lock();
        let descriptors = queries.get_mut(stage_id.query_id()).ok_or_else(|| {
            CoordinatorError::InvalidState(format!("Query {} is not registered", stage_id.query_id()))
        })?;
        let key = (stage_id.clone(), descriptor.partition_id);
        if descriptors.contains_key(&key) {
            return Err(CoordinatorError::InvalidState(format!(
                "Task descriptor for partition {} of stage {} already exists",
                descriptor.partition_id, stage_id
            )));
        }
        descriptors.insert(key, descriptor);
        Ok(())
    }

    pub fn get(&self, stage_id: &StageId, partition_id: u32) -> Option<TaskDescriptor> {
        self.queries
            .lock()
            .get(stage_id.query_id())
            .and_then(|descriptors| descriptors.get(&(stage_id.clone(), partition_id)))
            .cloned()
    }

    pub fn remove(&self, stage_id: &StageId, partition_id: u32) {
        if let Some(descriptors) = self.queries.lock().get_mut(stage_id.query_id()) {
            descriptors.remove(&(stage_id.clone(), partition_id));
        }
    }

    pub fn destroy(&self, query_id: &QueryId) {
        self.queries.lock().remove(query_id);
    }

    pub fn descriptor_count(&self, query_id: &QueryId) -> usize {
        self.queries
            .lock()
            .get(query_id)
            .map(|descriptors| descriptors.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(partition_id: u32) -> TaskDescriptor {
        TaskDescriptor {
            partition_id,
            splits: SplitAssignments::new(),
            node_requirements: NodeRequirements::default(),
        }
    }

    #[test]
    fn test_storage_lifecycle() {
        let storage = TaskDescriptorStorage::new();
        let query_id = QueryId::new("q");
        let stage_id = StageId::new(query_id.clone(), 1);

        assert!(storage.put(&stage_id, descriptor(0)).is_err());

        storage.initialize(&query_id);
        storage.put(&stage_id, descriptor(0)).unwrap();
        storage.put(&stage_id, descriptor(1)).unwrap();
        assert!(storage.put(&stage_id, descriptor(1)).is_err());
        assert_eq!(storage.get(&stage_id, 1), Some(descriptor(1)));

        storage.remove(&stage_id, 1);
        assert_eq!(storage.get(&stage_id, 1), None);
        assert_eq!(storage.descriptor_count(&query_id), 1);

        storage.destroy(&query_id);
        assert_eq!(storage.get(&stage_id, 0), None);
        assert_eq!(storage.descriptor_count(&query_id), 0);
    }
}
