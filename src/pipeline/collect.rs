//! Terminal collectors
//!
//! Each collector runs the stage it is called on, drains the output
//! channel to exhaustion in delivery order, and only then asks the
//! [`StageHandle`] for the run's final status. Delivery order across a
//! parallel worker pool is nondeterministic; callers needing a
//! deterministic result pass sort specs to [`Stage::collect_sorted`].
//!
//! [`StageHandle`]: crate::pipeline::StageHandle

use std::collections::HashMap;
use std::hash::Hash;

use tokio_util::sync::CancellationToken;

use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::ordering::{SortSpec, sort_by_specs};
use crate::pipeline::stage::Stage;

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Drain the pipeline into a `Vec` in delivery order
    ///
    /// On error the partial output is discarded and the error returned.
    pub async fn collect(self, token: &CancellationToken) -> PipelineResult<Vec<Out>> {
        self.collect_sorted(token, Vec::new()).await
    }

    /// Drain the pipeline into a `Vec`, then sort by the composed
    /// comparator
    ///
    /// Specs are evaluated left to right; an empty spec list leaves the
    /// result in delivery order. The sort is not guaranteed stable, so
    /// callers must not depend on tie order. On error the partial output
    /// is discarded and the error returned.
    pub async fn collect_sorted(
        self,
        token: &CancellationToken,
        specs: Vec<SortSpec<Out>>,
    ) -> PipelineResult<Vec<Out>> {
        let (mut output_rx, handle) = self.run(token);
        let mut output = Vec::new();
        while let Some(item) = output_rx.recv().await {
            output.push(item);
        }
        handle.wait(token).await?;
        sort_by_specs(&mut output, &specs);
        Ok(output)
    }

    /// Fold the pipeline's output left-associatively from `seed`
    ///
    /// Items are folded in delivery order, so the result is only
    /// deterministic for associative, commutative accumulators when the
    /// stage runs more than one worker. The accumulator is returned even
    /// when the run errored, alongside the error.
    pub async fn fold<Acc, F>(
        self,
        token: &CancellationToken,
        seed: Acc,
        fold_fn: F,
    ) -> (Acc, Option<PipelineError>)
    where
        F: Fn(Out, Acc) -> Acc,
    {
        let (mut output_rx, handle) = self.run(token);
        let mut acc = seed;
        while let Some(item) = output_rx.recv().await {
            acc = fold_fn(item, acc);
        }
        match handle.wait(token).await {
            Ok(()) => (acc, None),
            Err(err) => (acc, Some(err)),
        }
    }

    /// Partition the pipeline's output into buckets keyed by `key_fn`
    ///
    /// Values append to their bucket in delivery order. The partial map
    /// is returned even when the run errored, alongside the error.
    pub async fn group_by<K, V, KF, VF>(
        self,
        token: &CancellationToken,
        key_fn: KF,
        value_fn: VF,
    ) -> (HashMap<K, Vec<V>>, Option<PipelineError>)
    where
        K: Eq + Hash,
        KF: Fn(&Out) -> K,
        VF: Fn(Out) -> V,
    {
        let (mut output_rx, handle) = self.run(token);
        let mut groups: HashMap<K, Vec<V>> = HashMap::new();
        while let Some(item) = output_rx.recv().await {
            let key = key_fn(&item);
            groups.entry(key).or_default().push(value_fn(item));
        }
        match handle.wait(token).await {
            Ok(()) => (groups, None),
            Err(err) => (groups, Some(err)),
        }
    }
}
