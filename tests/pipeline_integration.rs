//! Integration tests for the pipeline engine
//!
//! Exercises whole chains end to end: source builders, filter/map
//! semantics across worker counts, terminal collectors, worker fault
//! isolation, upstream error propagation, and cancellation teardown.

use std::time::Duration;

use rstest::rstest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parql::{PipelineError, SortSpec, Stage};

#[test_log::test(tokio::test)]
async fn identity_single_worker_preserves_input_order() {
    let token = CancellationToken::new();
    let input: Vec<i64> = (0..500).collect();
    let output = Stage::from_seq(input.clone())
        .with_workers(1)
        .collect(&token)
        .await
        .unwrap();
    assert_eq!(output, input);
}

#[tokio::test]
async fn chain_of_single_worker_stages_preserves_order() {
    let token = CancellationToken::new();
    let output = Stage::from_seq(vec![1, 2, 3, 4, 5])
        .with_workers(1)
        .map(|n: i32| n * 10)
        .with_workers(1)
        .map(|n| n + 1)
        .with_workers(1)
        .collect(&token)
        .await
        .unwrap();
    assert_eq!(output, vec![11, 21, 31, 41, 51]);
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(16)]
#[tokio::test]
async fn filter_yields_exactly_the_matching_subset(#[case] workers: usize) {
    let token = CancellationToken::new();
    let output = Stage::from_seq((0..200).collect::<Vec<i32>>())
        .filter(|n| n % 3 == 0)
        .with_workers(workers)
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();
    let expected: Vec<i32> = (0..200).filter(|n| n % 3 == 0).collect();
    assert_eq!(output, expected);
}

#[tokio::test]
async fn stacked_filters_short_circuit_in_order() {
    let token = CancellationToken::new();
    let output = Stage::from_seq((0..50).collect::<Vec<i32>>())
        .filter(|n| n % 2 == 0)
        .filter(|n| *n > 10)
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();
    let expected: Vec<i32> = (12..50).step_by(2).collect();
    assert_eq!(output, expected);
}

#[tokio::test]
async fn map_composition_matches_composed_function() {
    let token = CancellationToken::new();
    let input: Vec<i32> = (0..100).collect();

    let chained = Stage::from_seq(input.clone())
        .map(|n| n + 1)
        .map(|n| n * 2)
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();

    let composed = Stage::from_seq(input)
        .map(|n| (n + 1) * 2)
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();

    assert_eq!(chained, composed);
}

#[tokio::test]
async fn flat_map_empty_output_drops_inputs() {
    let token = CancellationToken::new();
    let output = Stage::from_seq(vec![1, 2, 3, 4, 5, 6])
        .flat_map(|n| if n % 2 == 0 { vec![n, n] } else { Vec::new() })
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();
    assert_eq!(output, vec![2, 2, 4, 4, 6, 6]);
}

#[rstest]
#[case(1)]
#[case(8)]
#[tokio::test]
async fn collect_sorted_satisfies_composed_order(#[case] workers: usize) {
    let token = CancellationToken::new();
    let input: Vec<(i32, i32)> = (0..100).map(|n| (n % 5, n)).collect();
    let output = Stage::from_seq(input)
        .with_workers(workers)
        .collect_sorted(
            &token,
            vec![
                SortSpec::asc(|pair: &(i32, i32)| pair.0),
                SortSpec::desc(|pair: &(i32, i32)| pair.1),
            ],
        )
        .await
        .unwrap();
    for window in output.windows(2) {
        let (a, b) = (window[0], window[1]);
        assert!(a.0 < b.0 || (a.0 == b.0 && a.1 >= b.1), "out of order: {a:?} before {b:?}");
    }
    assert_eq!(output.len(), 100);
}

#[test_log::test(tokio::test)]
async fn fold_sums_filtered_evens() {
    let token = CancellationToken::new();
    let (total, err) = Stage::from_seq(vec![1, 2, 3, 4, 5])
        .filter(|n| n % 2 == 0)
        .fold(&token, 0, |item, acc| acc + item)
        .await;
    assert!(err.is_none());
    assert_eq!(total, 6);
}

#[tokio::test]
async fn group_by_parity_yields_two_groups() {
    let token = CancellationToken::new();
    let (groups, err) = Stage::from_seq(vec![1, 2, 3, 4, 5])
        .group_by(&token, |n| n % 2, |n| n)
        .await;
    assert!(err.is_none());
    assert_eq!(groups.len(), 2);

    let mut evens = groups[&0].clone();
    evens.sort_unstable();
    assert_eq!(evens, vec![2, 4]);

    let mut odds = groups[&1].clone();
    odds.sort_unstable();
    assert_eq!(odds, vec![1, 3, 5]);
}

#[tokio::test]
async fn from_stream_matches_from_seq() {
    let token = CancellationToken::new();
    let output = Stage::from_stream(futures::stream::iter(0..50))
        .filter(|n| n % 2 == 0)
        .map(|n| n * n)
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();
    let expected: Vec<i32> = (0..50).filter(|n| n % 2 == 0).map(|n| n * n).collect();
    assert_eq!(output, expected);
}

#[tokio::test]
async fn from_channel_drains_external_producer() {
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        for n in 0..50 {
            if tx.send(n).await.is_err() {
                break;
            }
        }
        // Dropping the sender exhausts the source.
    });

    let output = Stage::from_channel(rx)
        .filter(|n| n % 5 == 0)
        .collect_sorted(&token, vec![SortSpec::asc(|n: &i32| *n)])
        .await
        .unwrap();
    assert_eq!(output, vec![0, 5, 10, 15, 20, 25, 30, 35, 40, 45]);
}

#[test_log::test(tokio::test)]
async fn map_panic_surfaces_as_worker_fault_and_discards_output() {
    let token = CancellationToken::new();
    let result = Stage::from_seq(vec![0, 1, 2, 3, 4, 5])
        .map(|n| 100 / n)
        .with_label("divide")
        .collect(&token)
        .await;
    match result {
        Err(PipelineError::WorkerFault { stage, .. }) => assert_eq!(stage, "divide"),
        other => panic!("expected worker fault, got {other:?}"),
    }
}

#[tokio::test]
async fn filter_panic_surfaces_as_worker_fault() {
    let token = CancellationToken::new();
    let result = Stage::from_seq(vec![3, 2, 1, 0])
        .filter(|n| 12 % n == 0)
        .with_label("modulo-filter")
        .collect(&token)
        .await;
    match result {
        Err(PipelineError::WorkerFault { stage, .. }) => assert_eq!(stage, "modulo-filter"),
        other => panic!("expected worker fault, got {other:?}"),
    }
}

#[tokio::test]
async fn upstream_fault_propagates_verbatim_to_downstream_wait() {
    let token = CancellationToken::new();
    let result = Stage::from_seq(vec![1, 2, 0, 4])
        .map(|n| 10 / n)
        .with_label("upstream-divide")
        .map(|n| n + 1)
        .with_label("downstream-add")
        .collect(&token)
        .await;
    match result {
        Err(PipelineError::WorkerFault { stage, .. }) => assert_eq!(stage, "upstream-divide"),
        other => panic!("expected upstream worker fault, got {other:?}"),
    }
}

#[tokio::test]
async fn fold_returns_partial_accumulator_alongside_error() {
    let token = CancellationToken::new();
    let (count, err) = Stage::from_seq(vec![1, 2, 0, 4, 5])
        .map(|n| 10 / n)
        .fold(&token, 0usize, |_, acc| acc + 1)
        .await;
    assert!(matches!(err, Some(PipelineError::WorkerFault { .. })));
    // Delivery before the fault is nondeterministic; only the bound holds.
    assert!(count < 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_closes_output_and_wait_reports_it() {
    let token = CancellationToken::new();
    let (mut output_rx, handle) = Stage::from_seq((0..200).collect::<Vec<i32>>())
        .map(|n| {
            // Deliberately slow so cancellation lands mid-run.
            std::thread::sleep(Duration::from_millis(5));
            n
        })
        .with_workers(2)
        .run(&token);

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
    });

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = 0usize;
        while output_rx.recv().await.is_some() {
            seen += 1;
        }
        seen
    })
    .await
    .expect("output channel must close after cancellation");
    assert!(drained < 200, "cancellation should cut the run short");

    let err = tokio::time::timeout(Duration::from_secs(5), handle.wait(&token))
        .await
        .expect("wait must not deadlock after cancellation")
        .unwrap_err();
    assert_eq!(err, PipelineError::Cancelled);
}

#[tokio::test]
async fn pre_cancelled_token_yields_cancellation_error() {
    let token = CancellationToken::new();
    token.cancel();
    let result = Stage::from_seq((0..100).collect::<Vec<i32>>())
        .map(|n| n + 1)
        .collect(&token)
        .await;
    assert_eq!(result.unwrap_err(), PipelineError::Cancelled);
}

#[tokio::test]
async fn empty_sequence_completes_cleanly() {
    let token = CancellationToken::new();
    let output = Stage::from_seq(Vec::<i32>::new())
        .filter(|_| true)
        .map(|n| n)
        .collect(&token)
        .await
        .unwrap();
    assert!(output.is_empty());
}

#[tokio::test]
async fn try_with_workers_rejects_bounds_violations() {
    for workers in [0usize, 129] {
        let result = Stage::from_seq(vec![1]).try_with_workers(workers);
        assert!(matches!(result, Err(PipelineError::Configuration { .. })));
    }
}
