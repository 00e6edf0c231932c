//! Centralized error handling for the pipeline engine
//!
//! This module defines the error types a pipeline can surface and the
//! conventions around them:
//!
//! - **Cancellation errors**: the caller's token fired, or a sibling
//!   failure tore the stage's task group down
//! - **Worker fault errors**: a panic inside a user-supplied filter or
//!   map callback, caught at the worker boundary
//! - **Configuration errors**: invalid worker counts, rejected at call
//!   time rather than deferred to execution
//!
//! All asynchronous failures funnel into the owning stage's task group;
//! only the first one survives and is what [`StageHandle::wait`]
//! ultimately returns.
//!
//! [`StageHandle::wait`]: crate::pipeline::StageHandle::wait

pub mod types;

pub use types::*;

/// Convenience type alias for Results using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;
