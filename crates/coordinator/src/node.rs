//! Worker nodes and the placement services that map work onto them.

use crate::error::Result;
use crate::fragment::PartitioningHandle;
use crate::query::Session;
use crate::split::Split;
use crate::task::RemoteTask;
use crate::unblock::UnblockFuture;
use igloo_common::{CatalogHandle, NodeId};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalNode {
    pub node_id: NodeId,
    pub address: String,
    pub coordinator: bool,
}

impl InternalNode {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, coordinator: bool) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            address: address.into(),
            coordinator,
        }
    }
}

impl fmt::Display for InternalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_id, self.address)
    }
}

/// Splits placed onto nodes. Splits that could not be placed are handed back
/// in `unassigned` and `blocked` resolves once placing more may succeed.
pub struct SplitPlacementResult {
    pub assignments: Vec<(InternalNode, Vec<Split>)>,
    pub unassigned: Vec<Split>,
    pub blocked: UnblockFuture,
}

pub trait NodeSelector: Send + Sync {
    fn select_current_node(&self) -> InternalNode;

    fn all_nodes(&self) -> Vec<InternalNode>;

    fn select_random_nodes(&self, limit: usize, exclude: &HashSet<InternalNode>) -> Vec<InternalNode>;

    /// Places splits while respecting per-node queue limits, taking the
    /// splits already queued on `existing_tasks` into account.
    fn compute_assignments(&self, splits: Vec<Split>, existing_tasks: &[Arc<dyn RemoteTask>]) -> SplitPlacementResult;
}

pub trait NodeScheduler: Send + Sync {
    /// A selector restricted to nodes serving `catalog`, or all nodes.
    fn create_node_selector(&self, session: &Session, catalog: Option<&CatalogHandle>) -> Arc<dyn NodeSelector>;
}

/// Maps buckets of a partitioning directly to nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketNodeMap {
    bucket_to_node: Vec<InternalNode>,
}

impl BucketNodeMap {
    pub fn new(bucket_to_node: Vec<InternalNode>) -> Self {
        Self { bucket_to_node }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_to_node.len()
    }

    pub fn assigned_node(&self, bucket: u32) -> Option<&InternalNode> {
        self.bucket_to_node.get(bucket as usize)
    }

    /// The bucket of a connector split; splits without a bucket are hashed
    /// by id.
    pub fn bucket_for_split(&self, split: &Split) -> Option<u32> {
        let count = self.bucket_count() as u64;
        if count == 0 {
            return None;
        }
        let bucket = match split.bucket() {
            Some(bucket) => u64::from(bucket),
            None => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                split.id().hash(&mut hasher);
                hasher.finish()
            }
        };
        u32::try_from(bucket % count).ok()
    }
}

/// Maps buckets to partitions and partitions to nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePartitionMap {
    partition_to_node: Vec<InternalNode>,
    bucket_to_partition: Vec<u32>,
}

impl NodePartitionMap {
    pub fn new(partition_to_node: Vec<InternalNode>, bucket_to_partition: Vec<u32>) -> Self {
        Self {
            partition_to_node,
            bucket_to_partition,
        }
    }

    /// One bucket per node.
    pub fn for_nodes(nodes: Vec<InternalNode>) -> Self {
        let bucket_to_partition = (0..nodes.len() as u32).collect();
        Self::new(nodes, bucket_to_partition)
    }

    pub fn partition_to_node(&self) -> &[InternalNode] {
        &self.partition_to_node
    }

    pub fn bucket_to_partition(&self) -> &[u32] {
        &self.bucket_to_partition
    }

    pub fn as_bucket_node_map(&self) -> BucketNodeMap {
        BucketNodeMap::new(
            self.bucket_to_partition
                .iter()
                .filter_map(|partition| self.partition_to_node.get(*partition as usize).cloned())
                .collect(),
        )
    }
}

pub trait NodePartitioningManager: Send + Sync {
    fn node_partitioning_map(&self, session: &Session, partitioning: &PartitioningHandle) -> Result<NodePartitionMap>;

    fn bucket_node_map(&self, session: &Session, partitioning: &PartitioningHandle) -> Result<BucketNodeMap>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Alive,
    Gone,
    Unknown,
}

pub trait FailureDetector: Send + Sync {
    fn node_health(&self, node: &InternalNode) -> NodeHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(count: usize) -> Vec<InternalNode> {
        (0..count)
            .map(|i| InternalNode::new(format!("node-{}", i), format!("http://node-{}:8080", i), false))
            .collect()
    }

    #[test]
    fn test_bucket_node_map_from_partitions() {
        let map = NodePartitionMap::new(nodes(2), vec![0, 1, 1, 0]);
        let buckets = map.as_bucket_node_map();
        assert_eq!(buckets.bucket_count(), 4);
        assert_eq!(buckets.assigned_node(2).unwrap().node_id.as_str(), "node-1");
        assert!(buckets.assigned_node(4).is_none());
    }

    #[test]
    fn test_bucket_for_split() {
        let map = BucketNodeMap::new(nodes(3));
        let catalog = CatalogHandle::new("hive");
        assert_eq!(map.bucket_for_split(&Split::connector(catalog.clone(), "a").with_bucket(4)), Some(1));
        let hashed = map.bucket_for_split(&Split::connector(catalog.clone(), "b")).unwrap();
        assert!(hashed < 3);
        assert_eq!(BucketNodeMap::new(Vec::new()).bucket_for_split(&Split::connector(catalog, "c")), None);
    }
}
