#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use fanout::concurrency::cancel::create_cancel_channel;
use fanout::concurrency::signal::CompletionSignal;
use fanout::config::{FailurePolicy, FanOutConfig, InFlightPolicy, MergeStrategy};
use fanout::error::{ErrorKind, FetchError};
use fanout::fan_out::FanOut;
use fanout::fetcher::memory::MemoryFetcher;
use fanout::test_utils::fetcher::{Behavior, ControlledFetcher};
use fanout::types::OutcomeKind;
use fanout_telemetry::tracing::init_test_tracing;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::timeout;

const STRATEGIES: [MergeStrategy; 3] = [
    MergeStrategy::Serialized,
    MergeStrategy::Locked,
    MergeStrategy::Structured,
];

fn config(merge_strategy: MergeStrategy) -> FanOutConfig {
    FanOutConfig {
        merge_strategy,
        ..FanOutConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_slow_and_failing_items_all_land_in_input_order() {
    init_test_tracing();

    for strategy in STRATEGIES {
        let mut rng = rand::thread_rng();
        let mut fetcher = MemoryFetcher::new();

        // Items 0..10 are fast, 10..20 are slow, and every fifth item fails.
        for item in 0..20u32 {
            fetcher = if item % 5 == 4 {
                fetcher.with_failure(item, FetchError::UnexpectedStatus(500))
            } else {
                fetcher.with_success(item, item * 10)
            };

            let delay = if item < 10 {
                Duration::from_millis(rng.gen_range(0..3))
            } else {
                Duration::from_millis(rng.gen_range(20..40))
            };
            fetcher = fetcher.with_delay(&item, delay);
        }

        let fan_out = FanOut::new(config(strategy), fetcher.clone());
        let result = fan_out.fetch_all(0..20).await.unwrap();

        assert_eq!(result.len(), 20, "{strategy:?}");
        assert_eq!(result.requested(), 20);
        assert_eq!(result.count(OutcomeKind::Success), 16, "{strategy:?}");
        assert_eq!(result.count(OutcomeKind::Failure), 4, "{strategy:?}");

        for (index, entry) in result.entries().iter().enumerate() {
            assert_eq!(entry.index, index);
            assert_eq!(entry.item, index as u32);
            if index % 5 == 4 {
                assert!(matches!(
                    entry.outcome.as_failure(),
                    Some(FetchError::UnexpectedStatus(500))
                ));
            } else {
                assert_eq!(entry.outcome.as_success(), Some(&(index as u32 * 10)));
            }
        }

        // Every item was fetched exactly once.
        let mut calls = fetcher.calls().await;
        calls.sort_unstable();
        assert_eq!(calls, (0..20).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn thousand_concurrent_merges_lose_no_entry() {
    init_test_tracing();

    for strategy in STRATEGIES {
        let fetcher = ControlledFetcher::new();
        let fan_out = FanOut::builder()
            .fetcher(fetcher.clone())
            .max_concurrency(1000)
            .merge_strategy(strategy)
            .build()
            .unwrap();

        let result = fan_out.fetch_all(0..1000u32).await.unwrap();

        assert_eq!(result.len(), 1000, "{strategy:?}");
        assert_eq!(result.count(OutcomeKind::Success), 1000, "{strategy:?}");
        assert_eq!(
            result.into_successes(),
            (0..1000).collect::<Vec<_>>(),
            "{strategy:?}"
        );
        assert_eq!(fetcher.finished().await.len(), 1000);
    }
}

#[tokio::test]
async fn empty_input_completes_without_fetching() {
    for strategy in STRATEGIES {
        let fetcher = ControlledFetcher::<u32>::new();
        let fan_out = FanOut::new(config(strategy), fetcher.clone());

        let result = fan_out.fetch_all(Vec::new()).await.unwrap();

        assert!(result.is_empty());
        assert_eq!(result.requested(), 0);
        assert!(fetcher.started().await.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_identifier_is_recorded_next_to_successes() {
    init_test_tracing();

    for strategy in STRATEGIES {
        let fetcher = MemoryFetcher::new()
            .with_success(1, "one")
            .with_success(2, "two")
            .with_success(4, "four");
        let fan_out = FanOut::new(config(strategy), fetcher);

        let result = fan_out.fetch_all([1, 2, 3, 4]).await.unwrap();

        assert_eq!(result.len(), 4, "{strategy:?}");
        let failures: Vec<_> = result.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(*failures[0].0, 3);
        assert!(matches!(failures[0].1, FetchError::InvalidIdentifier(_)));
        assert_eq!(
            result.successes().map(|(_, value)| *value).collect::<Vec<_>>(),
            vec!["one", "two", "four"]
        );
    }
}

#[tokio::test]
async fn drop_policy_leaves_failures_out() {
    let fetcher = MemoryFetcher::new()
        .with_success(1, "one")
        .with_failure(2, FetchError::EmptyData)
        .with_success(3, "three");
    let fan_out = FanOut::builder()
        .fetcher(fetcher)
        .failure_policy(FailurePolicy::Drop)
        .build()
        .unwrap();

    let result = fan_out.fetch_all([1, 2, 3]).await.unwrap();

    assert_eq!(result.len(), 2);
    assert_eq!(result.requested(), 3);
    assert_eq!(result.dropped_failures(), 1);
    assert_eq!(result.count(OutcomeKind::Failure), 0);
    assert_eq!(
        result.entries().iter().map(|entry| entry.index).collect::<Vec<_>>(),
        vec![0, 2]
    );
}

#[tokio::test]
async fn duplicate_items_are_rejected_before_fetching() {
    let fetcher = ControlledFetcher::new();
    let fan_out = FanOut::new(FanOutConfig::default(), fetcher.clone());

    let err = fan_out.fetch_all([1u32, 2, 1]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(fetcher.started().await.is_empty());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_fetching() {
    let fetcher = ControlledFetcher::new();
    let fan_out = FanOut::new(
        FanOutConfig {
            max_concurrency: 0,
            ..FanOutConfig::default()
        },
        fetcher.clone(),
    );

    let err = fan_out.fetch_all([1u32, 2]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigError);
    assert!(fetcher.started().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_stays_within_limit() {
    init_test_tracing();

    let fetcher = MemoryFetcher::new().with_default_delay(Duration::from_millis(10));
    let fetcher = (0..24u32).fold(fetcher, |fetcher, item| fetcher.with_success(item, item));
    let fan_out = FanOut::builder()
        .fetcher(fetcher.clone())
        .max_concurrency(3)
        .build()
        .unwrap();

    let result = fan_out.fetch_all(0..24).await.unwrap();

    assert_eq!(result.count(OutcomeKind::Success), 24);
    assert!(fetcher.peak_in_flight() <= 3);
    assert!(fetcher.peak_in_flight() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn hanging_fetch_times_out_without_blocking_the_batch() {
    init_test_tracing();

    for strategy in STRATEGIES {
        let fetcher = ControlledFetcher::new();
        fetcher.set(2u32, Behavior::Hang).await;
        let fan_out = FanOut::new(
            FanOutConfig {
                item_timeout_ms: Some(50),
                ..config(strategy)
            },
            fetcher,
        );

        let result = timeout(Duration::from_secs(5), fan_out.fetch_all([1, 2, 3]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.len(), 3);
        assert!(matches!(
            result.entries()[1].outcome.as_failure(),
            Some(FetchError::Timeout(timeout)) if *timeout == Duration::from_millis(50)
        ));
        assert_eq!(result.count(OutcomeKind::Success), 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_fetch_is_contained() {
    init_test_tracing();

    for strategy in STRATEGIES {
        let fetcher = ControlledFetcher::new();
        fetcher.set(7u32, Behavior::Panic("decoder exploded")).await;
        let fan_out = FanOut::new(config(strategy), fetcher);

        let result = fan_out.fetch_all([6, 7, 8]).await.unwrap();

        assert_eq!(result.len(), 3, "{strategy:?}");
        match result.entries()[1].outcome.as_failure() {
            Some(FetchError::Unknown(message)) => assert!(message.contains("decoder exploded")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(result.into_successes(), vec![6, 8]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_lets_in_flight_fetches_complete() {
    init_test_tracing();

    for strategy in STRATEGIES {
        let fetcher = ControlledFetcher::new();
        fetcher.set_all(0..6u32, Behavior::Gated).await;
        let fan_out = FanOut::new(
            FanOutConfig {
                max_concurrency: 2,
                in_flight_on_cancel: InFlightPolicy::Complete,
                ..config(strategy)
            },
            fetcher.clone(),
        );
        let (cancel_tx, cancel_rx) = create_cancel_channel();

        let two_started = fetcher.notify_on_started(2).await;
        let batch = {
            let fan_out = fan_out.clone();
            tokio::spawn(async move { fan_out.fetch_all_with_cancel(0..6, cancel_rx).await })
        };

        two_started.notified().await;
        cancel_tx.cancel();
        fetcher.release_gated(2);

        let result = batch.await.unwrap().unwrap();

        assert_eq!(result.len(), 6, "{strategy:?}");
        assert_eq!(result.count(OutcomeKind::Success), 2, "{strategy:?}");
        assert_eq!(result.count(OutcomeKind::Cancelled), 4, "{strategy:?}");
        assert_eq!(fetcher.started().await.len(), 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_abandons_in_flight_fetches() {
    init_test_tracing();

    let fetcher = ControlledFetcher::new();
    fetcher.set_all(0..4u32, Behavior::Hang).await;
    let fan_out = FanOut::builder()
        .fetcher(fetcher.clone())
        .in_flight_on_cancel(InFlightPolicy::Abandon)
        .build()
        .unwrap();
    let (cancel_tx, cancel_rx) = create_cancel_channel();

    let all_started = fetcher.notify_on_started(4).await;
    let batch = tokio::spawn(async move { fan_out.fetch_all_with_cancel(0..4, cancel_rx).await });

    all_started.notified().await;
    cancel_tx.cancel();

    let result = timeout(Duration::from_secs(5), batch)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(result.len(), 4);
    assert_eq!(result.cancelled().count(), 4);
    assert!(fetcher.finished().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_runs_exactly_once_per_batch() {
    init_test_tracing();

    for items in [0u32, 1, 5] {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let fan_out = FanOut::new(FanOutConfig::default(), ControlledFetcher::new());

        let calls_clone = calls.clone();
        let handle = fan_out.spawn_fetch_all(0..items, move |result| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        let result = rx.await.unwrap().unwrap();
        handle.wait().await.unwrap();

        assert_eq!(result.len(), items as usize);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_batch_can_be_cancelled() {
    init_test_tracing();

    let fetcher = ControlledFetcher::new();
    fetcher.set_all(0..3u32, Behavior::Gated).await;
    let fan_out = FanOut::builder()
        .fetcher(fetcher.clone())
        .max_concurrency(1)
        .build()
        .unwrap();
    let (tx, rx) = oneshot::channel();

    let started = fetcher.notify_on_started(1).await;
    let handle = fan_out.spawn_fetch_all(0..3, move |result| {
        let _ = tx.send(result);
    });

    started.notified().await;
    handle.cancel();
    fetcher.release_gated(1);

    let result = rx.await.unwrap().unwrap();
    assert_eq!(result.count(OutcomeKind::Success), 1);
    assert_eq!(result.count(OutcomeKind::Cancelled), 2);
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn blocking_wait_inside_runtime_is_refused_while_notify_fires() {
    init_test_tracing();

    let signal = CompletionSignal::new();
    let guards: Vec<_> = (0..4).map(|_| signal.enter().unwrap()).collect();

    // Leaves happen on an independent pool of plain threads.
    let leavers: Vec<_> = guards
        .into_iter()
        .enumerate()
        .map(|(index, guard)| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * (index as u64 + 1)));
                guard.leave();
            })
        })
        .collect();

    let err = signal.wait_blocking().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BlockingWaitInRuntime);

    let (tx, rx) = oneshot::channel();
    signal.notify(move || {
        let _ = tx.send(());
    });

    timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    assert!(signal.is_fired());
    assert_eq!(signal.remaining(), 0);

    for leaver in leavers {
        leaver.join().unwrap();
    }
}
