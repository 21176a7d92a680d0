use crate::error::Result;
use crate::node::InternalNode;
use crate::query::Session;
use crate::unblock::UnblockFuture;
use igloo_common::{CatalogHandle, NodeId};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRequirements {
    /// Restricts placement to nodes serving this catalog.
    pub catalog: Option<CatalogHandle>,
    /// When non-empty, the task must run on one of these nodes.
    pub addresses: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryRequirements {
    pub required_bytes: u64,
}

impl MemoryRequirements {
    pub fn new(required_bytes: u64) -> Self {
        Self { required_bytes }
    }
}

/// A pending or granted reservation of capacity on a node. Leases must be
/// released once the task holding them completes.
pub trait NodeLease: Send + Sync {
    /// The granted node, or `None` while the lease is pending.
    fn node(&self) -> Option<InternalNode>;

    /// Resolves once the lease is granted.
    fn acquired(&self) -> UnblockFuture;

    fn release(&self);
}

pub trait NodeAllocator: Send + Sync {
    fn acquire(&self, requirements: NodeRequirements, memory: MemoryRequirements) -> Arc<dyn NodeLease>;

    /// Releases every outstanding lease.
    fn close(&self) -> Result<()>;
}

pub trait NodeAllocatorService: Send + Sync {
    fn node_allocator(&self, session: &Session) -> Arc<dyn NodeAllocator>;
}
