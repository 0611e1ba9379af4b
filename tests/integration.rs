//! Integration tests for cancellable concurrent pipelines

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipewright::prelude::*;
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A source that emits increasing numbers until cancelled
struct Endless;

#[async_trait]
impl Source for Endless {
    type Item = u64;

    async fn generate(&self, _ctx: &Context, emit: &Emitter<u64>) -> Result<()> {
        let mut n = 0;
        loop {
            emit.emit(n).await?;
            n += 1;
        }
    }
}

fn endless() -> Endless {
    Endless
}

#[tokio::test]
async fn test_single_worker_preserves_order() {
    init_tracing();
    let input: Vec<u32> = (0..200).rev().collect();
    let collector = CollectSink::new();

    let result = Pipeline::source(VecSource::new(input.clone()), StageConfig::new("input"))
        .stage(MapProcessor::new(|x: u32| x * 3), StageConfig::new("triple"))
        .sink(collector.clone(), StageConfig::new("collect"))
        .run(&Context::background())
        .await;

    assert!(result.is_success());
    let items = collector.items();
    let collected = items.lock().await;
    assert_eq!(*collected, input.iter().map(|x| x * 3).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_delivers_each_item_once() {
    for workers in 1..=8 {
        let collector = CollectSink::new();
        let result = Pipeline::source(RangeSource::new(0..500), StageConfig::new("range"))
            .stage(
                processor_fn(|_ctx, x: i64| async move {
                    tokio::task::yield_now().await;
                    Ok(Some(x))
                }),
                StageConfig::new("fan-out").workers(workers),
            )
            .sink(collector.clone(), StageConfig::new("collect"))
            .run(&Context::background())
            .await;

        assert_eq!(result.items_processed, 500);
        let mut items = collector.take().await;
        items.sort_unstable();
        assert_eq!(items, (0..500).collect::<Vec<_>>(), "workers = {workers}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_odd_doubling() {
    let collector = CollectSink::new();
    let result = Pipeline::source(RangeSource::new(1..11), StageConfig::new("numbers"))
        .stage(filter_fn(|x: &i64| x % 2 == 1), StageConfig::new("drop-even"))
        .stage(
            map_fn(|_ctx, x: i64| async move { Ok(x * 2) }),
            StageConfig::new("double").workers(3),
        )
        .sink(collector.clone(), StageConfig::new("collect"))
        .run(&Context::background())
        .await;

    assert_eq!(result.outcome(), Outcome::Success);
    assert_eq!(result.items_processed, 5);
    let items: HashSet<i64> = collector.take().await.into_iter().collect();
    assert_eq!(items, HashSet::from([2, 6, 10, 14, 18]));
}

#[tokio::test]
async fn test_merge_branches_keep_every_item() {
    let collector = CollectSink::new();
    let branch = |name: &str, items: Vec<u32>| {
        Pipeline::source(VecSource::new(items), StageConfig::new(name))
    };

    let result = branch("a", vec![1, 2, 3, 4])
        .merge(
            vec![branch("b", vec![10, 20, 30]), branch("c", vec![100, 200])],
            StageConfig::new("merge").buffer_capacity(4),
        )
        .sink(collector.clone(), StageConfig::new("collect"))
        .run(&Context::background())
        .await;

    assert_eq!(result.items_processed, 9);
    let items = collector.take().await;

    let mut sorted = items.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3, 4, 10, 20, 30, 100, 200]);

    let pick = |range: std::ops::Range<u32>| -> Vec<u32> {
        items.iter().copied().filter(|x| range.contains(x)).collect()
    };
    assert_eq!(pick(0..10), vec![1, 2, 3, 4]);
    assert_eq!(pick(10..100), vec![10, 20, 30]);
    assert_eq!(pick(100..1000), vec![100, 200]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_returns_promptly_without_leaks() {
    init_tracing();
    let ctx = Context::background();
    let probe = Arc::new(());
    let sink = Arc::new(CountSink::new());

    let pipeline = {
        let probe = probe.clone();
        Pipeline::source(endless(), StageConfig::new("endless"))
            .stage(
                MapProcessor::new(move |x: u64| {
                    let _held = &probe;
                    x + 1
                }),
                StageConfig::new("inc").workers(4),
            )
            .stage(
                DelayProcessor::new(Duration::from_millis(1)),
                StageConfig::new("slow").workers(2).buffer_capacity(8),
            )
            .sink(sink.clone(), StageConfig::new("count"))
    };

    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        })
    };

    let result = tokio::time::timeout(Duration::from_secs(2), pipeline.run(&ctx))
        .await
        .expect("run should return after cancel");
    canceller.await.unwrap();

    assert_eq!(result.outcome(), Outcome::Cancelled);
    assert!(matches!(result.cause, Some(Error::Cancelled)));
    assert!(result.items_processed > 0);
    assert_eq!(result.items_processed, sink.count());
    assert!(result.errors.is_empty());

    // Every stage task has dropped its share of the bodies.
    assert_eq!(Arc::strong_count(&probe), 1);
    assert_eq!(Arc::strong_count(&sink), 1);
}

#[tokio::test]
async fn test_deadline_cuts_run_short() {
    let collector = CollectSink::new();
    let result = Pipeline::source(
        IntervalSource::new((0..100).collect::<Vec<u32>>(), Duration::from_millis(5)),
        StageConfig::new("ticks"),
    )
    .deadline(Duration::from_millis(50))
    .sink(collector.clone(), StageConfig::new("collect"))
    .run(&Context::background())
    .await;

    assert_eq!(result.outcome(), Outcome::TimedOut);
    assert!(result.cause.as_ref().is_some_and(Error::is_deadline_exceeded));
    assert!(result.items_processed < 100);
    assert_eq!(result.items_processed as usize, collector.take().await.len());
    assert_err!(result.into_result());
}

#[tokio::test]
async fn test_caller_deadline_is_reported() {
    let ctx = Context::background().with_timeout(Duration::from_millis(30));
    let result = Pipeline::source(endless(), StageConfig::new("endless"))
        .stage(DelayProcessor::new(Duration::from_millis(2)), StageConfig::new("slow"))
        .sink(DiscardSink::new(), StageConfig::new("discard"))
        .run(&ctx)
        .await;

    assert_eq!(result.outcome(), Outcome::TimedOut);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn test_skip_and_continue_is_partial_success() {
    let collector = CollectSink::new();
    let result = Pipeline::source(RangeSource::new(0..10), StageConfig::new("range"))
        .stage(
            TryMapProcessor::new(|x: i64| {
                if x % 4 == 0 {
                    Err(Error::custom(format!("rejected {x}")))
                } else {
                    Ok(x)
                }
            }),
            StageConfig::new("validate"),
        )
        .sink(collector.clone(), StageConfig::new("collect"))
        .run(&Context::background())
        .await;

    assert_eq!(result.outcome(), Outcome::PartialSuccess);
    assert_eq!(result.items_processed, 7);
    assert_eq!(result.failed_items, 3);

    // Errors arrive in the order they occurred and name the failing item.
    let failing: Vec<_> = result
        .errors
        .iter()
        .map(|e| match e {
            Error::Stage { stage, item, .. } => {
                assert_eq!(&**stage, "validate");
                item.expect("item identity")
            }
            other => panic!("unexpected error {other}"),
        })
        .collect();
    assert_eq!(failing, vec![0, 4, 8]);
    assert_eq!(assert_ok!(result.into_result()), 7);
}

#[tokio::test]
async fn test_every_item_failing_is_failure() {
    let result = Pipeline::source(RangeSource::new(0..5), StageConfig::new("range"))
        .stage(
            TryMapProcessor::new(|_: i64| -> Result<i64> { Err(Error::custom("nope")) }),
            StageConfig::new("reject"),
        )
        .sink(DiscardSink::new(), StageConfig::new("discard"))
        .run(&Context::background())
        .await;

    assert_eq!(result.outcome(), Outcome::Failed);
    assert_eq!(result.items_processed, 0);
    assert_eq!(result.errors.len(), 5);
    assert!(!result.failed);
}

#[tokio::test]
async fn test_item_deadline_is_an_item_failure() {
    init_tracing();
    for capacity in [0, 8] {
        let collector = CollectSink::new();

        let result = Pipeline::source(iter_source(1..=5u32), StageConfig::new("src").buffer_capacity(capacity))
            .stage(
                map_fn(|ctx: Context, x: u32| async move {
                    if x == 2 {
                        // A per-request timeout shorter than the call.
                        ctx.with_timeout(Duration::from_millis(1))
                            .run(tokio::time::sleep(Duration::from_millis(50)))
                            .await?;
                    }
                    Ok::<_, Error>(x)
                }),
                StageConfig::new("fetch"),
            )
            .sink(collector.clone(), StageConfig::new("collect"))
            .run(&Context::background())
            .await;

        assert_eq!(result.outcome(), Outcome::PartialSuccess, "capacity {capacity}");
        assert_eq!(result.items_processed, 4);
        assert_eq!(result.failed_items, 1);
        assert!(result.cause.is_none());
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            &result.errors[0],
            Error::Stage { stage, item: Some(1), .. } if &**stage == "fetch"
        ));
        assert!(result.errors[0].is_deadline_exceeded());
        assert_eq!(collector.take().await, vec![1, 3, 4, 5]);
    }
}

#[tokio::test]
async fn test_cancelled_error_from_live_stage_is_recorded() {
    let collector = CollectSink::new();

    let result = Pipeline::source(RangeSource::new(0..6), StageConfig::new("numbers"))
        .stage(
            TryMapProcessor::new(|x: i64| if x == 3 { Err(Error::Cancelled) } else { Ok(x) }),
            StageConfig::new("flaky"),
        )
        .sink(collector.clone(), StageConfig::new("collect"))
        .run(&Context::background())
        .await;

    assert_eq!(result.outcome(), Outcome::PartialSuccess);
    assert_eq!(result.items_processed, 5);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].is_cancellation());
    assert_eq!(collector.take().await, vec![0, 1, 2, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_stage_closes_downstream_early() {
    let collector = CollectSink::new();
    let ctx = Context::background();
    let result = Pipeline::source(endless(), StageConfig::new("endless"))
        .stage(
            TryMapProcessor::new(|x: u64| {
                if x == 20 {
                    Err(Error::custom("fatal record"))
                } else {
                    Ok(x)
                }
            }),
            StageConfig::new("strict").abort_on_error(),
        )
        .sink(collector.clone(), StageConfig::new("collect"))
        .run(&ctx);
    let result = tokio::time::timeout(Duration::from_secs(2), result)
        .await
        .expect("aborted run should finish");

    assert_eq!(result.outcome(), Outcome::Failed);
    assert!(result.failed);
    assert!(result.cause.is_none());
    assert!(matches!(
        &result.errors[0],
        Error::Stage { item: Some(20), .. }
    ));
    assert_eq!(collector.take().await, (0..20).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborting_sink_drains_endless_upstream() {
    let written = Arc::new(AtomicU64::new(0));
    let sink = {
        let written = written.clone();
        sink_fn(move |_ctx, x: u64| {
            let written = written.clone();
            async move {
                if x == 5 {
                    return Err(Error::custom("disk full"));
                }
                written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
    };

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        Pipeline::source(endless(), StageConfig::new("endless"))
            .sink(sink, StageConfig::new("write").abort_on_error())
            .run(&Context::background()),
    )
    .await
    .expect("aborted sink should not hang the run");

    assert_eq!(result.outcome(), Outcome::Failed);
    assert_eq!(result.items_processed, 5);
    assert_eq!(written.load(Ordering::Relaxed), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fail_fast_stops_every_stage() {
    let sink = sink_fn(|_ctx, x: u64| async move {
        if x == 3 {
            Err(Error::custom("rejected"))
        } else {
            Ok(())
        }
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        Pipeline::source(endless(), StageConfig::new("endless"))
            .stage(MapProcessor::new(|x: u64| x), StageConfig::new("pass").workers(2))
            .fail_fast(true)
            .sink(sink, StageConfig::new("write"))
            .run(&Context::background()),
    )
    .await
    .expect("fail-fast run should stop");

    assert_eq!(result.outcome(), Outcome::Failed);
    assert!(result.cause.is_none());
    assert_eq!(result.errors.len(), 1);
}

#[tokio::test]
async fn test_source_failure_fails_run() {
    let source = source_fn(|_ctx, emit| async move {
        emit.emit(1u8).await?;
        Err::<(), _>(Error::custom("connection reset"))
    });
    let result = Pipeline::source(source, StageConfig::new("reader"))
        .sink(CountSink::new(), StageConfig::new("count"))
        .run(&Context::background())
        .await;

    assert_eq!(result.outcome(), Outcome::Failed);
    assert_eq!(result.items_processed, 1);
    assert!(matches!(&result.errors[0], Error::Stage { item: None, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_with_buffered_jobs() {
    let jobs: Vec<u64> = (1..=30).collect();
    let collector = CollectSink::new();

    let result = Pipeline::source(VecSource::new(jobs.clone()), StageConfig::new("jobs").buffer_capacity(jobs.len()))
        .stage(
            processor_fn(|ctx: Context, job: u64| async move {
                ctx.run(tokio::time::sleep(Duration::from_millis(job % 3))).await?;
                Ok::<_, Error>(Some((job, job * job)))
            }),
            StageConfig::new("workers").workers(5).buffer_capacity(jobs.len()),
        )
        .sink(collector.clone(), StageConfig::new("results"))
        .run(&Context::background())
        .await;

    assert!(result.is_success());
    let results: HashMap<u64, u64> = collector.take().await.into_iter().collect();
    assert_eq!(results.len(), jobs.len());
    assert!(jobs.iter().all(|j| results[j] == j * j));
}

#[tokio::test]
async fn test_task_group_collects_exactly_the_failures() {
    let failing: HashSet<u64> = HashSet::from([1, 4, 7]);
    let ctx = Context::background();
    let mut group = TaskGroup::new(&ctx);

    for i in 0..10u64 {
        let fails = failing.contains(&i);
        group.spawn(move |_| async move {
            // Reverse the completion order relative to the spawn order.
            tokio::time::sleep(Duration::from_millis(30 * (10 - i))).await;
            if fails {
                Err(Error::custom(format!("task {i}")))
            } else {
                Ok(())
            }
        });
    }

    let errors = group.wait().await;
    let reported: HashSet<u64> = errors
        .iter()
        .map(|e| match e {
            Error::Task { task, .. } => task.0,
            other => panic!("unexpected error {other}"),
        })
        .collect();
    assert_eq!(reported, failing);

    let order: Vec<u64> = errors
        .iter()
        .map(|e| match e {
            Error::Task { task, .. } => task.0,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(order, vec![7, 4, 1]);
}

#[tokio::test]
async fn test_task_group_timeouts_are_distinct_from_failures() {
    let ctx = Context::background();
    let mut group = TaskGroup::new(&ctx).with_task_timeout(Duration::from_millis(20));
    group.spawn(|ctx| async move { ctx.run(std::future::pending::<()>()).await });
    group.spawn(|_| async { Err(Error::custom("bad input")) });
    group.spawn(|_| async { Ok(()) });

    let errors = group.wait().await;
    assert_eq!(errors.len(), 2);
    assert_eq!(errors.iter().filter(|e| e.is_deadline_exceeded()).count(), 1);
    assert_eq!(errors.iter().filter(|e| !e.is_cancellation()).count(), 1);
}

#[tokio::test]
async fn test_double_close_is_detected() {
    let (producer, stream) = channel::<u8>(2);
    assert_ok!(producer.close());
    assert!(matches!(producer.close(), Err(Error::AlreadyClosed)));
    assert_eq!(assert_ok!(stream.recv(&Context::background()).await), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_standalone_dispatcher() {
    let ctx = Context::background();
    let (producer, stream) = channel(0);
    let seen = Arc::new(AtomicU64::new(0));

    let handle = {
        let seen = seen.clone();
        Dispatcher::new("consumers", 3).run(&ctx, stream, move |delivery: Delivery<u64>| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(delivery.item, Ordering::Relaxed);
                Flow::Continue
            }
        })
    };

    for i in 1..=100 {
        producer.send(&ctx, i).await.unwrap();
    }
    producer.close().unwrap();

    let report = handle.join().await;
    assert_eq!(report.handled, 100);
    assert_eq!(seen.load(Ordering::Relaxed), 5050);
}
