//! Common crate
//!
//! Shared identifiers, error codes and failure records for Igloo.
//!
//! # Example
//! ```rust
//! use igloo_common::{ErrorCode, ExecutionFailure};
//! let failure = ExecutionFailure::new(ErrorCode::GENERIC_INTERNAL_ERROR, "example failure");
//! assert!(failure.error_code().is_some());
//! ```

pub mod catalog;
pub mod error;
pub mod ids;

pub use catalog::CatalogHandle;
pub use error::{Error, ErrorCode, ErrorType, ExecutionFailure, Result};
pub use ids::{NodeId, PlanFragmentId, PlanNodeId, QueryId, StageId, TaskId};
