//! The parallel query pipeline engine
//!
//! A pipeline is a chain of [`Stage`]s, each owning its own worker pool
//! and connected to its neighbors by bounded channels. Construction is
//! lazy: nothing runs until a terminal collector (or [`Stage::run`]
//! directly) starts the outermost stage, which recursively starts its
//! upstream chain. Cancellation flows down through a
//! `CancellationToken`; the first failure anywhere in a stage's task
//! group cancels its siblings and is the one error that stage reports.

pub mod collect;
pub mod ordering;
pub mod stage;

pub use ordering::{Direction, SortSpec, compare_by_specs, sort_by_specs};
pub use stage::{Stage, StageHandle};
