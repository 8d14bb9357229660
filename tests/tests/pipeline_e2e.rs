//! End-to-end pipeline scenarios over the in-memory broker and store.
//!
//! Each `TestContext::worker` is a separate worker process: its own lock
//! holder and gate, sharing only the broker and the quota store.

use chrono::Duration as ChronoDuration;
use enrich_core::TaskKind;
use integration_tests::setup::TestContext;
use std::time::Duration;
use worker::{DeferReason, Outcome};

/// Two workers race on resource "k1": one executes, the other defers on the
/// lock, and the deferred message succeeds once the lock is released.
#[tokio::test]
async fn test_lock_race_on_same_resource() {
    let ctx = TestContext::new(TaskKind::LeakCheck, 100).await;
    let worker_a = ctx.worker("worker-a");
    let worker_b = ctx.worker("worker-b");

    // At-least-once delivery handed the same logical unit out twice
    ctx.publish("k1").await;
    ctx.publish("k1").await;

    ctx.executor.hold();
    let first = ctx.receive().await.unwrap();
    let second = ctx.receive().await.unwrap();

    let (a_outcome, b_outcome) = tokio::join!(ctx.process(&worker_a, first), async {
        // Let worker A reach `executing` before B tries the lock
        while ctx.executor.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let outcome = ctx.process(&worker_b, second).await;
        ctx.executor.open();
        outcome
    });

    assert_eq!(a_outcome, Outcome::Succeeded);
    assert_eq!(b_outcome, Outcome::Deferred(DeferReason::Lock));
    assert_eq!(ctx.executor.call_count(), 1, "exactly one worker executed");
    assert!(!ctx.lock_held("k1").await);

    // The requeued duplicate goes through now that the lock is free
    assert_eq!(ctx.step(&worker_b).await, Outcome::Succeeded);
    assert_eq!(ctx.executor.calls(), vec!["k1", "k1"]);
    assert_eq!(ctx.sink.count(), 2);
    assert_eq!(ctx.ready() + ctx.pending(), 0);
}

/// Daily limit 2, three tasks: two succeed today, the third waits for the
/// quota to reset at the next local midnight.
#[tokio::test]
async fn test_daily_limit_holds_third_task_until_reset() {
    let ctx = TestContext::new(TaskKind::DomainEmail, 2).await;
    let worker = ctx.worker("worker-a");
    for domain in ["a.example", "b.example", "c.example"] {
        ctx.publish(domain).await;
    }

    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.usage().await, 2);

    // Redelivered and deferred as often as it is polled, never attempted
    for _ in 0..3 {
        assert_eq!(ctx.step(&worker).await, Outcome::Deferred(DeferReason::Quota));
    }
    let waiting = ctx.receive().await.unwrap();
    assert_eq!(waiting.state.attempt, 0);
    assert_eq!(ctx.executor.call_count(), 2);

    ctx.clock.advance(ChronoDuration::hours(24));
    assert_eq!(ctx.usage().await, 0);
    assert_eq!(ctx.process(&worker, waiting).await, Outcome::Succeeded);
    assert_eq!(ctx.sink.count(), 3);
    assert_eq!(ctx.usage().await, 1);
}

/// The counter that admits tasks is the one every worker increments.
#[tokio::test]
async fn test_quota_is_shared_across_workers() {
    let ctx = TestContext::new(TaskKind::Phone, 3).await;
    let workers = [ctx.worker("a"), ctx.worker("b"), ctx.worker("c")];
    for n in 0..4 {
        ctx.publish(&format!("Person {}", n)).await;
    }

    for worker in &workers {
        assert_eq!(ctx.step(worker).await, Outcome::Succeeded);
    }
    assert_eq!(
        ctx.step(&ctx.worker("d")).await,
        Outcome::Deferred(DeferReason::Quota)
    );
    assert_eq!(ctx.usage().await, 3);
}

/// Concurrent usage recording never loses an increment.
#[tokio::test]
async fn test_concurrent_usage_recording_is_exact() {
    let ctx = TestContext::new(TaskKind::Serp, 10_000).await;
    let gate = ctx.gate();

    let handles: Vec<_> = (0..200)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.record_usage(TaskKind::Serp).await.unwrap() })
        })
        .collect();
    let mut counts = Vec::new();
    for handle in handles {
        counts.push(handle.await.unwrap());
    }

    assert_eq!(ctx.usage().await, 200);
    counts.sort_unstable();
    assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
}

/// A sliding-window ceiling spaces out bursts even with daily quota left.
#[tokio::test]
async fn test_window_limit_defers_bursts() {
    let ctx = TestContext::with_spec(TaskKind::Phone, |spec| {
        spec.daily_limit(16).window_limit(1, Duration::from_secs(1))
    })
    .await;
    let worker = ctx.worker("worker-a");
    ctx.publish("Ada").await;
    ctx.publish("Grace").await;

    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.step(&worker).await, Outcome::Deferred(DeferReason::Quota));

    ctx.clock.advance(ChronoDuration::milliseconds(1100));
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.usage().await, 2);
}

/// Results land in the sink with the attempt count they took.
#[tokio::test]
async fn test_result_carries_task_identity() {
    let ctx = TestContext::new(TaskKind::ShodanHost, 10).await;
    let worker = ctx.worker("worker-a");
    ctx.executor.fail_transient(1);
    ctx.publish("8.8.8.8").await;

    assert_eq!(ctx.step(&worker).await, Outcome::Retried);
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);

    let results = ctx.sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, TaskKind::ShodanHost);
    assert_eq!(results[0].resource_key, "8.8.8.8");
    assert_eq!(results[0].attempts, 2);
    assert_eq!(results[0].output["found"], true);
}

/// A kind with a result cache answers repeat lookups from the cache: the
/// provider is not called again and no quota is spent until the entry expires.
#[tokio::test]
async fn test_cached_result_skips_provider_and_quota() {
    let ctx = TestContext::with_spec(TaskKind::ShodanHost, |spec| {
        spec.daily_limit(10).cache_ttl(Duration::from_secs(3600))
    })
    .await;
    let worker = ctx.worker("worker-a");
    ctx.publish("1.1.1.1").await;
    ctx.publish("1.1.1.1").await;

    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.step(&ctx.worker("worker-b")).await, Outcome::Cached);

    assert_eq!(ctx.executor.call_count(), 1);
    assert_eq!(ctx.usage().await, 1);
    assert!(!ctx.lock_held("1.1.1.1").await);
    assert_eq!(ctx.ready() + ctx.pending(), 0);

    let results = ctx.sink.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].output, results[0].output);
    assert_ne!(results[1].task_id, results[0].task_id);

    // Once the entry lapses the provider is asked again
    ctx.clock.advance(ChronoDuration::hours(1));
    ctx.publish("1.1.1.1").await;
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.executor.call_count(), 2);
    assert_eq!(ctx.usage().await, 2);
}

/// A cache hit is served even with the daily quota spent.
#[tokio::test]
async fn test_cache_hit_needs_no_quota() {
    let ctx = TestContext::with_spec(TaskKind::ShodanHost, |spec| {
        spec.daily_limit(1).cache_ttl(Duration::from_secs(3600))
    })
    .await;
    let worker = ctx.worker("worker-a");
    ctx.publish("8.8.8.8").await;
    ctx.publish("8.8.8.8").await;
    ctx.publish("8.8.4.4").await;

    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.step(&worker).await, Outcome::Cached);
    assert_eq!(ctx.step(&worker).await, Outcome::Deferred(DeferReason::Quota));
    assert_eq!(ctx.executor.call_count(), 1);
}

/// Kinds without a cache TTL call the provider every time.
#[tokio::test]
async fn test_uncached_kind_calls_provider_each_time() {
    let ctx = TestContext::new(TaskKind::ShodanHost, 10).await;
    let worker = ctx.worker("worker-a");
    ctx.publish("1.1.1.1").await;
    ctx.publish("1.1.1.1").await;

    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.executor.call_count(), 2);
    assert_eq!(ctx.usage().await, 2);
}
