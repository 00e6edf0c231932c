//! Lazily-evaluated, parallel query pipelines over tokio channels.
//!
//! A pipeline is a chain of typed [`Stage`]s — source, filters,
//! map/flat-map — executed by a pool of worker tasks per stage, with
//! cooperative cancellation and first-error propagation. It trades
//! ordering for parallel throughput: output order is nondeterministic
//! whenever a stage runs more than one worker, and callers needing a
//! deterministic result sort at the end with [`SortSpec`]s.
//!
//! ```
//! use parql::{SortSpec, Stage};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let token = CancellationToken::new();
//! let squares = Stage::from_seq((1..=10).collect::<Vec<i32>>())
//!     .filter(|n| n % 2 == 0)
//!     .map(|n| n * n)
//!     .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
//!     .await
//!     .unwrap();
//! assert_eq!(squares, vec![4, 16, 36, 64, 100]);
//! # });
//! ```
//!
//! A stage is consumed by the `run` that starts it, so its output feeds
//! exactly one downstream consumer; sharing an upstream stage between
//! two pipelines is rejected at compile time. Failures — including
//! panics inside user callbacks, which are caught at the worker
//! boundary — close the output channel, tear the chain down, and
//! surface as a single [`PipelineError`] per run.

pub mod errors;
pub mod pipeline;

pub use errors::{PipelineError, PipelineResult};
pub use pipeline::{Direction, SortSpec, Stage, StageHandle};
