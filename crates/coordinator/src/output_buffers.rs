//! Output buffer layouts handed to tasks, and the managers that grow them as
//! consumer tasks appear.

use crate::error::{CoordinatorError, Result};
use crate::exchange::ExchangeSinkInstanceHandle;
use crate::fragment::PartitioningHandle;
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputBuffers {
    Partitioned {
        version: u64,
        partition_count: u32,
    },
    Broadcast {
        version: u64,
        buffer_ids: Vec<u32>,
        no_more_buffer_ids: bool,
    },
    Arbitrary {
        version: u64,
        buffer_ids: Vec<u32>,
        no_more_buffer_ids: bool,
    },
    Spooling {
        version: u64,
        sink: ExchangeSinkInstanceHandle,
        output_partition_count: u32,
    },
}

impl OutputBuffers {
    pub fn version(&self) -> u64 {
        match self {
            OutputBuffers::Partitioned { version, .. }
            | OutputBuffers::Broadcast { version, .. }
            | OutputBuffers::Arbitrary { version, .. }
            | OutputBuffers::Spooling { version, .. } => *version,
        }
    }
}

#[derive(Debug, Default)]
pub struct DynamicBuffers {
    version: u64,
    buffer_ids: BTreeSet<u32>,
    no_more_buffer_ids: bool,
}

impl DynamicBuffers {
    fn add(&mut self, buffer_id: u32) {
        if self.no_more_buffer_ids {
            tracing::debug!("Ignoring output buffer {} added after the buffer set was sealed", buffer_id);
            return;
        }
        if self.buffer_ids.insert(buffer_id) {
            self.version += 1;
        }
    }

    fn seal(&mut self) {
        if !self.no_more_buffer_ids {
            self.no_more_buffer_ids = true;
            self.version += 1;
        }
    }
}

/// Decides the output buffer layout of the tasks of one stage.
#[derive(Debug)]
pub enum OutputBufferManager {
    /// A fixed number of partitions known up front.
    Partitioned { partition_count: u32 },
    /// Every consumer receives all rows.
    Broadcast(Mutex<DynamicBuffers>),
    /// Rows go to any consumer, used by scaled writers.
    Scaled(Mutex<DynamicBuffers>),
}

impl OutputBufferManager {
    pub fn partitioned(partition_count: u32) -> Self {
        OutputBufferManager::Partitioned { partition_count }
    }

    /// A single output partition for a stage feeding a single-node consumer.
    pub fn single_stream(output_partitioning: &PartitioningHandle) -> Result<Self> {
        if !output_partitioning.is_single_node() {
            return Err(CoordinatorError::Internal(format!(
                "Expected a single node output partitioning, got {:?}",
                output_partitioning
            )));
        }
        Ok(Self::partitioned(1))
    }

    pub fn broadcast() -> Self {
        OutputBufferManager::Broadcast(Mutex::new(DynamicBuffers::default()))
    }

    pub fn scaled() -> Self {
        OutputBufferManager::Scaled(Mutex::new(DynamicBuffers::default()))
    }

    pub fn add_output_buffer(&self, buffer_id: u32) {
        match self {
            OutputBufferManager::Partitioned { .. } => {}
            OutputBufferManager::Broadcast(buffers) | OutputBufferManager::Scaled(buffers) => {
                buffers.lock().add(buffer_id)
            }
        }
    }

    pub fn no_more_buffers(&self) {
        match self {
            OutputBufferManager::Partitioned { .. } => {}
            OutputBufferManager::Broadcast(buffers) | OutputBufferManager::Scaled(buffers) => buffers.lock().seal(),
        }
    }

    pub fn output_buffers(&self) -> OutputBuffers {
        match self {
            OutputBufferManager::Partitioned { partition_count } => OutputBuffers::Partitioned {
                version: 0,
                partition_count: *partition_count,
            },
            OutputBufferManager::Broadcast(buffers) => {
                let buffers = buffers.lock();
                OutputBuffers::Broadcast {
                    version: buffers.version,
                    buffer_ids: buffers.buffer_ids.iter().copied().collect(),
                    no_more_buffer_ids: buffers.no_more_buffer_ids,
                }
            }
            OutputBufferManager::Scaled(buffers) => {
                let buffers = buffers.lock();
                OutputBuffers::Arbitrary {
                    version: buffers.version,
                    buffer_ids: buffers.buffer_ids.iter().copied().collect(),
                    no_more_buffer_ids: buffers.no_more_buffer_ids,
                }
            }
        }
    }
}
