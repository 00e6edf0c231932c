//! Error type definitions for the pipeline engine
//!
//! A single flat enum covers every failure a running pipeline can
//! report. Upstream stage errors are forwarded downstream verbatim, so
//! there is deliberately no "wrapped upstream" variant: the error a
//! caller sees is the error the originating stage produced.

use thiserror::Error;

/// Inclusive bounds for a stage's worker pool size.
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 128;

/// All errors a pipeline run can surface
///
/// Uses `thiserror` to provide automatic error trait implementations.
/// At most one of these is delivered per `run`; concurrent failures in
/// the same task group are dropped in favor of the first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The caller's cancellation token fired, or the stage's task group
    /// was torn down by a sibling failure
    #[error("pipeline cancelled")]
    Cancelled,

    /// A user-supplied filter or map callback panicked; caught at the
    /// worker boundary so sibling workers keep draining until teardown
    #[error("worker {worker} of stage '{stage}' faulted: {message}")]
    WorkerFault {
        stage: String,
        worker: usize,
        message: String,
    },

    /// Invalid pipeline configuration, raised at call time
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl PipelineError {
    /// Create a worker fault error tagged with stage and worker identity
    pub fn worker_fault<S: Into<String>, M: Into<String>>(stage: S, worker: usize, message: M) -> Self {
        Self::WorkerFault {
            stage: stage.into(),
            worker,
            message: message.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is a cancellation rather than a real fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
