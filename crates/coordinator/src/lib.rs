//! Query scheduling for the Igloo coordinator.
//!
//! A query plan is split into stages. Stages pinned to the coordinator are
//! run once by [`CoordinatorStagesScheduler`]; the remaining stages are run
//! on workers by a distributed scheduler chosen from the retry policy, and
//! [`SqlQueryScheduler`] re-runs them when a whole-query retry is allowed.

pub mod config;
pub mod coordinator_stages;
pub mod distributed;
pub mod dynamic_filters;
pub mod error;
pub mod exchange;
pub mod execution_schedule;
pub mod fault_tolerant;
pub mod fragment;
pub mod node;
pub mod output_buffers;
pub mod query;
pub mod scheduler;
pub mod services;
pub mod split;
pub mod stage;
pub mod stage_execution;
pub mod stage_scheduler;
pub mod state_machine;
pub mod stats;
pub mod task;
pub mod unblock;

pub use config::{RetryPolicy, SchedulerSettings};
pub use coordinator_stages::CoordinatorStagesScheduler;
pub use distributed::{DistributedStagesScheduler, DistributedStagesSchedulerState, StageFailureInfo};
pub use error::{CoordinatorError, Result};
pub use query::{QueryState, QueryStateMachine, Session};
pub use scheduler::SqlQueryScheduler;
pub use services::SchedulerServices;
pub use stage_execution::{StageExecution, StageExecutionState};
