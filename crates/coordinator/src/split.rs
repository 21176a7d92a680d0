//! Units of input data and the sources that enumerate them.

use crate::error::Result;
use crate::exchange::ExchangeInput;
use crate::fragment::PlanFragment;
use crate::query::Session;
use crate::unblock::{self, UnblockFuture};
use futures::future::{BoxFuture, FutureExt, Shared};
use igloo_common::{CatalogHandle, ExecutionFailure, NodeId, PlanNodeId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum SplitKind {
    Connector {
        id: String,
        bucket: Option<u32>,
        addresses: Vec<NodeId>,
    },
    /// Output of an upstream task or of a spooling exchange.
    Remote(ExchangeInput),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    catalog: CatalogHandle,
    kind: SplitKind,
}

impl Split {
    pub fn connector(catalog: CatalogHandle, id: impl Into<String>) -> Self {
        Self {
            catalog,
            kind: SplitKind::Connector {
                id: id.into(),
                bucket: None,
                addresses: Vec::new(),
            },
        }
    }

    pub fn remote(input: ExchangeInput) -> Self {
        Self {
            catalog: CatalogHandle::remote(),
            kind: SplitKind::Remote(input),
        }
    }

    pub fn with_bucket(mut self, value: u32) -> Self {
        if let SplitKind::Connector { bucket, .. } = &mut self.kind {
            *bucket = Some(value);
        }
        self
    }

    pub fn with_addresses(mut self, nodes: Vec<NodeId>) -> Self {
        if let SplitKind::Connector { addresses, .. } = &mut self.kind {
            *addresses = nodes;
        }
        self
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    pub fn kind(&self) -> &SplitKind {
        &self.kind
    }

    pub fn id(&self) -> Option<&str> {
        match &self.kind {
            SplitKind::Connector { id, .. } => Some(id),
            SplitKind::Remote(_) => None,
        }
    }

    pub fn bucket(&self) -> Option<u32> {
        match &self.kind {
            SplitKind::Connector { bucket, .. } => *bucket,
            SplitKind::Remote(_) => None,
        }
    }

    pub fn remote_input(&self) -> Option<&ExchangeInput> {
        match &self.kind {
            SplitKind::Remote(input) => Some(input),
            SplitKind::Connector { .. } => None,
        }
    }
}

/// Splits keyed by the plan node that consumes them.
pub type SplitAssignments = HashMap<PlanNodeId, Vec<Split>>;

#[derive(Debug, Clone, PartialEq)]
pub struct SplitBatch {
    pub splits: Vec<Split>,
    pub last_batch: bool,
}

pub type SplitBatchFuture = BoxFuture<'static, std::result::Result<SplitBatch, ExecutionFailure>>;

pub trait SplitSource: Send + Sync {
    fn catalog_handle(&self) -> &CatalogHandle;

    fn next_batch(&self, max_size: usize) -> SplitBatchFuture;

    fn is_finished(&self) -> bool;

    /// Must be idempotent: sources are closed both by their scheduler and
    /// when the query completes.
    fn close(&self) -> Result<()>;
}

pub trait SplitSourceFactory: Send + Sync {
    fn create_split_sources(
        &self,
        session: &Session,
        fragment: &PlanFragment,
    ) -> Result<HashMap<PlanNodeId, Arc<dyn SplitSource>>>;
}

pub(crate) enum FetchResult {
    Splits(Vec<Split>),
    Blocked(UnblockFuture),
    Exhausted,
}

/// Pulls batches from a split source without blocking the scheduling loop.
pub(crate) struct SplitBatchFetcher {
    source: Arc<dyn SplitSource>,
    batch_size: usize,
    pending: Option<Shared<SplitBatchFuture>>,
    exhausted: bool,
}

impl SplitBatchFetcher {
    pub(crate) fn new(source: Arc<dyn SplitSource>, batch_size: usize) -> Self {
        Self {
            source,
            batch_size,
            pending: None,
            exhausted: false,
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn SplitSource> {
        &self.source
    }

    pub(crate) fn fetch(&mut self) -> Result<FetchResult> {
        if self.exhausted {
            return Ok(FetchResult::Exhausted);
        }
        let pending = match &self.pending {
            Some(pending) => pending.clone(),
            None => {
                let pending = self.source.next_batch(self.batch_size).shared();
                self.pending = Some(pending.clone());
                pending
            }
        };
        match pending.clone().now_or_never() {
            None => Ok(FetchResult::Blocked(unblock::from_future(pending))),
            Some(result) => {
                self.pending = None;
                let batch = result?;
                if batch.last_batch {
                    self.exhausted = true;
                }
                Ok(FetchResult::Splits(batch.splits))
            }
        }
    }
}
