//! Stage construction and the execution protocol
//!
//! A [`Stage`] is one node of a pipeline: a source (materialized
//! sequence, external channel, stream, or an upstream stage), an ordered
//! list of filter predicates, and a map function producing zero or more
//! outputs per input. [`Stage::run`] spawns the stage's task group
//! (producer, upstream supervisor, worker pool, finalizer) and returns
//! the output channel together with a [`StageHandle`] used to retrieve
//! the run's final status.
//!
//! Stages are consumed by `run` (or by a terminal collector), so a stage
//! cannot be started twice and its output feeds exactly one downstream
//! consumer. Reusing an upstream stage across two pipelines is therefore
//! a compile error rather than a double-execution hazard.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{MAX_WORKERS, MIN_WORKERS, PipelineError, PipelineResult};

/// Shared handle to a filter predicate
type FilterFn<In> = Arc<dyn Fn(&In) -> bool + Send + Sync>;

/// Shared handle to a map function (one input, zero or more outputs)
type MapFn<In, Out> = Arc<dyn Fn(In) -> Vec<Out> + Send + Sync>;

/// An upstream stage with its input type erased
///
/// Lets a `Stage<In, Out>` hold any `Stage<_, In>` as its parent without
/// the whole chain's types accumulating in the downstream signature.
pub(crate) trait Upstream<T>: Send {
    fn run_boxed(self: Box<Self>, token: &CancellationToken) -> (mpsc::Receiver<T>, StageHandle);
}

/// The one source a stage draws items from
///
/// Exactly one variant exists per stage by construction, replacing the
/// "at most one of several nullable fields" convention with an enum.
enum StageInput<In> {
    /// Finite materialized sequence, fed by a producer task
    Sequence(Vec<In>),
    /// Externally driven channel, consumed directly by the worker pool
    Channel(mpsc::Receiver<In>),
    /// Arbitrary stream, forwarded by a producer task
    Stream(BoxStream<'static, In>),
    /// Upstream stage; its output channel becomes this stage's input
    Upstream(Box<dyn Upstream<In>>),
}

/// One node of a parallel query pipeline
///
/// Built fluently, then consumed exactly once by [`Stage::run`] or a
/// terminal collector. Filters run in order with short-circuit on the
/// first failing predicate; only items passing every filter reach the
/// map function. Output order across workers is not guaranteed unless
/// the stage runs with a single worker.
pub struct Stage<In, Out> {
    input: StageInput<In>,
    filters: Vec<FilterFn<In>>,
    map_fn: MapFn<In, Out>,
    workers: usize,
    label: String,
}

/// Default worker count: available hardware parallelism, clamped
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
        .clamp(MIN_WORKERS, MAX_WORKERS)
}

impl<T> Stage<T, T>
where
    T: Send + 'static,
{
    /// Leaf stage over a materialized finite sequence, with an identity
    /// map and no filters
    pub fn from_seq(data: Vec<T>) -> Self {
        Self::leaf(StageInput::Sequence(data))
    }

    /// Leaf stage over an externally driven, possibly unbounded channel
    ///
    /// The receiver is drained directly by the worker pool; no producer
    /// task is spawned.
    pub fn from_channel(input: mpsc::Receiver<T>) -> Self {
        Self::leaf(StageInput::Channel(input))
    }

    /// Leaf stage over any [`Stream`], forwarded by a producer task
    pub fn from_stream(input: impl Stream<Item = T> + Send + 'static) -> Self {
        Self::leaf(StageInput::Stream(input.boxed()))
    }

    fn leaf(input: StageInput<T>) -> Self {
        Self {
            input,
            filters: Vec::new(),
            map_fn: Arc::new(|item| vec![item]),
            workers: default_workers(),
            label: "source".to_string(),
        }
    }
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Derived stage applying a 1-to-1 transform to this stage's output
    pub fn map<Next, F>(self, map_fn: F) -> Stage<Out, Next>
    where
        Next: Send + 'static,
        F: Fn(Out) -> Next + Send + Sync + 'static,
    {
        Stage {
            input: StageInput::Upstream(Box::new(self)),
            filters: Vec::new(),
            map_fn: Arc::new(move |item| vec![map_fn(item)]),
            workers: default_workers(),
            label: "map".to_string(),
        }
    }

    /// Derived stage applying a 1-to-N transform to this stage's output
    ///
    /// Inputs mapped to an empty sequence are dropped from the output.
    pub fn flat_map<Next, F>(self, map_fn: F) -> Stage<Out, Next>
    where
        Next: Send + 'static,
        F: Fn(Out) -> Vec<Next> + Send + Sync + 'static,
    {
        Stage {
            input: StageInput::Upstream(Box::new(self)),
            filters: Vec::new(),
            map_fn: Arc::new(map_fn),
            workers: default_workers(),
            label: "flat_map".to_string(),
        }
    }

    /// Append a filter predicate, evaluated before this stage's map
    ///
    /// Predicates run in insertion order and short-circuit on the first
    /// one returning false.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&In) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(predicate));
        self
    }

    /// Set the worker pool size for this stage
    ///
    /// # Panics
    ///
    /// Panics if `workers` is outside `[1, 128]`. Use
    /// [`Stage::try_with_workers`] for a fallible variant.
    pub fn with_workers(self, workers: usize) -> Self {
        match self.try_with_workers(workers) {
            Ok(stage) => stage,
            Err(err) => panic!("{err}"),
        }
    }

    /// Fallible variant of [`Stage::with_workers`]
    pub fn try_with_workers(mut self, workers: usize) -> PipelineResult<Self> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(PipelineError::configuration(format!(
                "worker count must be within {MIN_WORKERS}..={MAX_WORKERS}, got {workers}"
            )));
        }
        self.workers = workers;
        Ok(self)
    }

    /// Name this stage for diagnostics (worker fault messages, tracing)
    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }

    /// Start this stage and its whole upstream chain
    ///
    /// Non-blocking: returns the output channel immediately while the
    /// stage's task group runs in the background. The output channel is
    /// always closed, no later than the error sink inside the returned
    /// [`StageHandle`], so draining to exhaustion and then calling
    /// [`StageHandle::wait`] cannot deadlock.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(self, token: &CancellationToken) -> (mpsc::Receiver<Out>, StageHandle) {
        let Stage {
            input,
            filters,
            map_fn,
            workers,
            label,
        } = self;
        let label: Arc<str> = label.into();

        // First failure in the group cancels this token; the caller's
        // token cancels it transitively.
        let group = token.child_token();
        let (output_tx, output_rx) = mpsc::channel::<Out>(workers);
        let (error_tx, error_rx) = mpsc::channel::<PipelineError>(1);
        let mut tasks: JoinSet<PipelineResult<()>> = JoinSet::new();

        debug!(stage = %label, workers, "starting stage");

        let input_rx = resolve_input(input, workers, &group, &mut tasks);
        let input_rx = Arc::new(Mutex::new(input_rx));

        for worker in 0..workers {
            let input_rx = Arc::clone(&input_rx);
            let output_tx = output_tx.clone();
            let cancel = group.clone();
            let filters = filters.clone();
            let map_fn = Arc::clone(&map_fn);
            let label = Arc::clone(&label);
            tasks.spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        item = recv_shared(&input_rx) => match item {
                            Some(item) => item,
                            None => return Ok(()),
                        },
                    };
                    let outputs = apply(&label, worker, &filters, &map_fn, item)?;
                    for out in outputs {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                            sent = output_tx.send(out) => {
                                // A dropped consumer ends the stage cleanly.
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
            });
        }
        // Workers hold the only senders now; the output channel closes
        // when the last worker exits.
        drop(output_tx);

        let finalizer_label = Arc::clone(&label);
        tokio::spawn(async move {
            let mut first: Option<PipelineError> = None;
            while let Some(joined) = tasks.join_next().await {
                let failure = match joined {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(join_err) => Some(PipelineError::worker_fault(
                        finalizer_label.as_ref(),
                        0,
                        format!("stage task aborted: {join_err}"),
                    )),
                };
                if let Some(err) = failure {
                    if first.is_none() {
                        trace!(stage = %finalizer_label, error = %err, "stage task failed, cancelling siblings");
                        group.cancel();
                        first = Some(err);
                    } else {
                        trace!(stage = %finalizer_label, error = %err, "dropping subsequent error");
                    }
                }
            }
            if let Some(err) = first {
                // Capacity 1 and a single writer: this cannot block.
                let _ = error_tx.try_send(err);
            }
            // Dropping error_tx closes the sink; all output senders are
            // already gone by this point.
        });

        (output_rx, StageHandle { errors: error_rx })
    }
}

/// Turn a stage's declared input into the channel its workers drain
///
/// Spawns the producer task for sequence and stream inputs, and the
/// supervisory task forwarding upstream errors for parent inputs.
fn resolve_input<In: Send + 'static>(
    input: StageInput<In>,
    workers: usize,
    group: &CancellationToken,
    tasks: &mut JoinSet<PipelineResult<()>>,
) -> mpsc::Receiver<In> {
    match input {
        StageInput::Channel(rx) => rx,
        StageInput::Sequence(data) => {
            let (tx, rx) = mpsc::channel(data.len().max(1));
            let cancel = group.clone();
            tasks.spawn(async move {
                for item in data {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Ok(())
            });
            rx
        }
        StageInput::Stream(mut stream) => {
            let (tx, rx) = mpsc::channel(workers);
            let cancel = group.clone();
            tasks.spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        item = stream.next() => match item {
                            Some(item) => item,
                            None => return Ok(()),
                        },
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            });
            rx
        }
        StageInput::Upstream(parent) => {
            // The upstream subtree shares this stage's group token, so a
            // failure on either side tears down the whole chain.
            let (rx, parent_handle) = parent.run_boxed(group);
            let cancel = group.clone();
            tasks.spawn(async move { parent_handle.wait(&cancel).await });
            rx
        }
    }
}

/// Receive the next item from the input channel shared across workers
///
/// The lock is held only for the duration of the `recv`, never across
/// filter/map evaluation or output sends.
async fn recv_shared<T>(input: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
    input.lock().await.recv().await
}

/// Run filters then map for one item, isolating callback panics
///
/// A panic inside a user-supplied predicate or map function is caught at
/// this boundary and returned as a [`PipelineError::WorkerFault`] tagged
/// with the stage label and worker index, so one poisoned item cannot
/// crash the process or strand sibling workers.
fn apply<In, Out>(
    stage: &str,
    worker: usize,
    filters: &[FilterFn<In>],
    map_fn: &MapFn<In, Out>,
    item: In,
) -> PipelineResult<Vec<Out>> {
    catch_unwind(AssertUnwindSafe(|| {
        for filter in filters {
            if !filter(&item) {
                return Vec::new();
            }
        }
        map_fn(item)
    }))
    .map_err(|payload| PipelineError::worker_fault(stage, worker, panic_message(payload)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

impl<In, Out> Upstream<Out> for Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn run_boxed(self: Box<Self>, token: &CancellationToken) -> (mpsc::Receiver<Out>, StageHandle) {
        (*self).run(token)
    }
}

/// Receiver side of a running stage's single-slot error sink
///
/// Returned by [`Stage::run`]; holds the only way to learn how the run
/// ended. The sink carries at most one error, the first one any task in
/// the stage's group reported.
pub struct StageHandle {
    errors: mpsc::Receiver<PipelineError>,
}

impl StageHandle {
    /// Block until the stage's subtree completes or errors
    ///
    /// Returns the caller's cancellation as [`PipelineError::Cancelled`]
    /// if the token fires first; otherwise returns the first error the
    /// run produced, or `Ok(())` if the sink closed empty. Safe to call
    /// after draining the output channel: the output channel closes no
    /// later than the sink.
    pub async fn wait(mut self, token: &CancellationToken) -> PipelineResult<()> {
        tokio::select! {
            _ = token.cancelled() => Err(PipelineError::Cancelled),
            err = self.errors.recv() => match err {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}
