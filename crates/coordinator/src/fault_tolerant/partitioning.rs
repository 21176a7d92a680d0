use crate::error::Result;
use crate::fragment::PartitioningHandle;
use crate::node::{BucketNodeMap, InternalNode, NodePartitioningManager};
use crate::query::Session;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketToPartition {
    pub bucket_to_partition: Option<Vec<u32>>,
    pub bucket_node_map: Option<BucketNodeMap>,
}

/// Resolves the bucket to partition mapping of each partitioning handle once
/// per query.
pub struct BucketToPartitionCache {
    session: Session,
    node_partitioning_manager: Arc<dyn NodePartitioningManager>,
    partition_count: u32,
    cache: HashMap<PartitioningHandle, BucketToPartition>,
}

impl BucketToPartitionCache {
    pub fn new(
        session: Session,
        node_partitioning_manager: Arc<dyn NodePartitioningManager>,
        partition_count: u32,
    ) -> Self {
        Self {
            session,
            node_partitioning_manager,
            partition_count,
            cache: HashMap::new(),
        }
    }

    pub fn get(&mut self, partitioning: &PartitioningHandle) -> Result<BucketToPartition> {
        if let Some(cached) = self.cache.get(partitioning) {
            return Ok(cached.clone());
        }
        let resolved = self.resolve(partitioning)?;
        self.cache.insert(partitioning.clone(), resolved.clone());
        Ok(resolved)
    }

    fn resolve(&self, partitioning: &PartitioningHandle) -> Result<BucketToPartition> {
        if *partitioning == PartitioningHandle::FixedHash {
            return Ok(BucketToPartition {
                bucket_to_partition: Some((0..self.partition_count).collect()),
                bucket_node_map: None,
            });
        }
        if partitioning.catalog_handle().is_none() {
            return Ok(BucketToPartition::default());
        }

        let bucket_node_map = self
            .node_partitioning_manager
            .bucket_node_map(&self.session, partitioning)?;
        // buckets owned by the same node share a partition
        let mut node_to_partition: HashMap<InternalNode, u32> = HashMap::new();
        let mut bucket_to_partition = Vec::with_capacity(bucket_node_map.bucket_count());
        for bucket in 0..bucket_node_map.bucket_count() as u32 {
            let Some(node) = bucket_node_map.assigned_node(bucket) else {
                continue;
            };
            let next_partition = node_to_partition.len() as u32;
            let partition = *node_to_partition.entry(node.clone()).or_insert(next_partition);
            bucket_to_partition.push(partition);
        }
        Ok(BucketToPartition {
            bucket_to_partition: Some(bucket_to_partition),
            bucket_node_map: Some(bucket_node_map),
        })
    }
}
