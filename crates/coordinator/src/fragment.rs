//! Plan fragments as seen by the scheduler

use igloo_common::{CatalogHandle, PlanFragmentId, PlanNodeId};
use std::sync::Arc;

/// How the rows of a fragment are distributed across tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitioningHandle {
    /// A single task on the coordinator.
    CoordinatorOnly,
    /// A single task on a worker.
    Single,
    /// Tasks follow the splits of the fragment's table scan.
    Source,
    /// Writer tasks added on demand as written data grows.
    ScaledWriter,
    FixedHash,
    FixedArbitrary,
    FixedBroadcast,
    /// Partitioning supplied by a connector, with buckets mapped to nodes.
    Catalog { catalog: CatalogHandle, name: String },
}

impl PartitioningHandle {
    pub fn is_coordinator_only(&self) -> bool {
        matches!(self, PartitioningHandle::CoordinatorOnly)
    }

    pub fn is_single_node(&self) -> bool {
        matches!(self, PartitioningHandle::CoordinatorOnly | PartitioningHandle::Single)
    }

    pub fn catalog_handle(&self) -> Option<&CatalogHandle> {
        match self {
            PartitioningHandle::Catalog { catalog, .. } => Some(catalog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Gather,
    Repartition,
    Replicate,
}

/// A plan node reading the output of one or more child fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSourceNode {
    pub id: PlanNodeId,
    pub source_fragment_ids: Vec<PlanFragmentId>,
    pub exchange_type: ExchangeType,
}

impl RemoteSourceNode {
    pub fn new(id: impl Into<String>, source_fragment_ids: Vec<PlanFragmentId>, exchange_type: ExchangeType) -> Self {
        Self {
            id: PlanNodeId::new(id),
            source_fragment_ids,
            exchange_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanFragment {
    pub id: PlanFragmentId,
    /// Distribution of the fragment's own tasks.
    pub partitioning: PartitioningHandle,
    /// Distribution of the fragment's output as consumed by its parent.
    pub output_partitioning: PartitioningHandle,
    /// Table scan nodes, in the order their splits are scheduled.
    pub partitioned_sources: Vec<PlanNodeId>,
    pub remote_source_nodes: Vec<RemoteSourceNode>,
}

impl PlanFragment {
    pub fn new(id: u32, partitioning: PartitioningHandle, output_partitioning: PartitioningHandle) -> Self {
        Self {
            id: PlanFragmentId(id),
            partitioning,
            output_partitioning,
            partitioned_sources: Vec::new(),
            remote_source_nodes: Vec::new(),
        }
    }

    pub fn with_partitioned_source(mut self, id: impl Into<String>) -> Self {
        self.partitioned_sources.push(PlanNodeId::new(id));
        self
    }

    pub fn with_remote_source(mut self, node: RemoteSourceNode) -> Self {
        self.remote_source_nodes.push(node);
        self
    }

    pub fn has_table_scan(&self) -> bool {
        !self.partitioned_sources.is_empty()
    }

    pub fn all_remote_sources_replicated(&self) -> bool {
        self.remote_source_nodes
            .iter()
            .all(|node| node.exchange_type == ExchangeType::Replicate)
    }

    pub fn remote_source_for(&self, fragment_id: PlanFragmentId) -> Option<&RemoteSourceNode> {
        self.remote_source_nodes
            .iter()
            .find(|node| node.source_fragment_ids.contains(&fragment_id))
    }
}

/// A fragment together with the fragments feeding it.
#[derive(Debug, Clone)]
pub struct SubPlan {
    pub fragment: Arc<PlanFragment>,
    pub children: Vec<SubPlan>,
}

impl SubPlan {
    pub fn new(fragment: PlanFragment, children: Vec<SubPlan>) -> Self {
        Self {
            fragment: Arc::new(fragment),
            children,
        }
    }

    /// Fragments in pre-order: every parent precedes its children.
    pub fn all_fragments(&self) -> Vec<Arc<PlanFragment>> {
        let mut fragments = vec![self.fragment.clone()];
        for child in &self.children {
            fragments.extend(child.all_fragments());
        }
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_order_is_parents_first() {
        let plan = SubPlan::new(
            PlanFragment::new(0, PartitioningHandle::CoordinatorOnly, PartitioningHandle::CoordinatorOnly),
            vec![SubPlan::new(
                PlanFragment::new(1, PartitioningHandle::FixedHash, PartitioningHandle::Single),
                vec![SubPlan::new(
                    PlanFragment::new(2, PartitioningHandle::Source, PartitioningHandle::FixedHash),
                    Vec::new(),
                )],
            )],
        );
        let ids: Vec<u32> = plan.all_fragments().iter().map(|f| f.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_replicated_sources() {
        let fragment = PlanFragment::new(1, PartitioningHandle::FixedHash, PartitioningHandle::Single)
            .with_partitioned_source("scan")
            .with_remote_source(RemoteSourceNode::new(
                "build",
                vec![PlanFragmentId(2)],
                ExchangeType::Replicate,
            ));
        assert!(fragment.has_table_scan());
        assert!(fragment.all_remote_sources_replicated());
        assert_eq!(fragment.remote_source_for(PlanFragmentId(2)).unwrap().id.as_str(), "build");
        assert!(fragment.remote_source_for(PlanFragmentId(3)).is_none());
    }
}
