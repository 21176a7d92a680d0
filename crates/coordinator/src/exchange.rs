//! Exchanges carry stage output between tasks. Pipelined execution streams
//! directly from upstream tasks; fault tolerant execution spools output into
//! an exchange so a failed task can be re-run without its producers.

use crate::error::Result;
use futures::future::BoxFuture;
use igloo_common::{ExecutionFailure, QueryId, TaskId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeContext {
    pub query_id: QueryId,
    pub exchange_id: ExchangeId,
}

/// A writer slot for one output partition of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSinkHandle {
    pub exchange_id: ExchangeId,
    pub task_partition_id: u32,
}

/// A sink bound to a specific task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSinkInstanceHandle {
    pub sink: ExchangeSinkHandle,
    pub attempt_id: u32,
}

/// Spooled data of one output partition, readable by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSourceHandle {
    pub exchange_id: ExchangeId,
    pub partition_id: u32,
    pub data_size_bytes: u64,
}

/// Where a consumer task reads an upstream result from.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeInput {
    Direct { task_id: TaskId, location: String },
    Spooling { source_handles: Vec<ExchangeSourceHandle> },
}

pub type SourceHandlesFuture = BoxFuture<'static, std::result::Result<Vec<ExchangeSourceHandle>, ExecutionFailure>>;

pub trait Exchange: Send + Sync {
    fn id(&self) -> &ExchangeId;

    fn add_sink(&self, task_partition_id: u32) -> ExchangeSinkHandle;

    fn instantiate_sink(&self, sink: &ExchangeSinkHandle, attempt_id: u32) -> ExchangeSinkInstanceHandle;

    fn no_more_sinks(&self);

    fn sink_finished(&self, sink: &ExchangeSinkHandle, attempt_id: u32);

    /// Resolves once every sink has finished and no more sinks will be added.
    fn source_handles(&self) -> SourceHandlesFuture;

    fn close(&self) -> Result<()>;
}

pub trait ExchangeManager: Send + Sync {
    fn create_exchange(
        &self,
        context: ExchangeContext,
        output_partition_count: u32,
        preserve_order_within_partition: bool,
    ) -> Result<Arc<dyn Exchange>>;
}
