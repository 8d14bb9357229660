//! Failure handling: decode errors, retries, dead letters, crashes.

use broker::MessageBroker;
use enrich_core::{ExecutorError, TaskKind};
use integration_tests::{fixtures, setup::TestContext};
use std::time::Duration;
use worker::Outcome;

#[tokio::test]
async fn test_decode_failures_dead_letter_on_first_attempt() {
    let ctx = TestContext::new(TaskKind::Serp, 100).await;
    let worker = ctx.worker("worker-a");
    let bodies = fixtures::malformed_bodies();
    for body in &bodies {
        ctx.publish_raw(body).await;
    }

    for _ in &bodies {
        assert_eq!(ctx.step(&worker).await, Outcome::DeadLettered);
    }

    assert_eq!(ctx.ready() + ctx.pending(), 0, "nothing requeued");
    assert_eq!(ctx.executor.call_count(), 0);
    let dead = ctx.broker.dead_letters(&ctx.topology(), 10).await.unwrap();
    assert_eq!(dead.len(), bodies.len());
    assert!(dead.iter().all(|d| d.record.attempts == 1));
}

#[tokio::test]
async fn test_kind_mismatch_is_a_decode_failure() {
    let ctx = TestContext::new(TaskKind::Serp, 100).await;
    let body = fixtures::envelope(TaskKind::Phone, "Ada Lovelace").to_bytes().unwrap();
    ctx.publish_raw(&body).await;

    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::DeadLettered);
    let dead = ctx.broker.dead_letters(&ctx.topology(), 1).await.unwrap();
    assert!(dead[0].record.reason.contains("phone"));
}

/// Each attempt runs on a freshly started worker: the attempt count comes from
/// delivery metadata, never from worker memory.
#[tokio::test]
async fn test_transient_failure_retried_to_max_attempts_across_restarts() {
    let ctx = TestContext::new(TaskKind::LeakCheck, 100).await;
    ctx.executor.fail_transient(3);
    ctx.publish("a@b.com").await;

    assert_eq!(ctx.step(&ctx.worker("boot-1")).await, Outcome::Retried);
    assert_eq!(ctx.step(&ctx.worker("boot-2")).await, Outcome::Retried);
    assert_eq!(ctx.step(&ctx.worker("boot-3")).await, Outcome::DeadLettered);

    assert_eq!(ctx.executor.call_count(), 3);
    assert_eq!(ctx.ready() + ctx.pending(), 0);
    assert_eq!(ctx.usage().await, 0, "failed tasks consume no quota");
    assert!(!ctx.lock_held("a@b.com").await);

    let dead = ctx.broker.dead_letters(&ctx.topology(), 1).await.unwrap();
    let record = &dead[0].record;
    assert_eq!(record.attempts, 3);
    assert_eq!(
        record.failures.iter().map(|f| f.attempt).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(record.reason, "transient executor failure: upstream 503 #3");
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let ctx = TestContext::new(TaskKind::DomainEmail, 100).await;
    ctx.executor.push(Err(ExecutorError::permanent("400 unknown domain")));
    ctx.publish("nope.invalid").await;

    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::DeadLettered);
    assert_eq!(ctx.executor.call_count(), 1);
    assert_eq!(ctx.dead_lettered(), 1);
}

/// The dead letter keeps the body byte-for-byte, and replaying it runs the
/// original task again.
#[tokio::test]
async fn test_dead_letter_preserves_body_for_replay() {
    let ctx = TestContext::new(TaskKind::Serp, 100).await;
    let body = fixtures::hand_written_body(TaskKind::Serp, "rust streams");
    ctx.executor.push(Err(ExecutorError::permanent("quota plan expired")));
    ctx.publish_raw(&body).await;

    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::DeadLettered);
    let dead = ctx.broker.dead_letters(&ctx.topology(), 1).await.unwrap();
    assert_eq!(dead[0].body.as_ref(), body.as_slice());

    ctx.publisher.replay(&ctx.topology(), &dead[0]).await.unwrap();
    let replayed = ctx.receive().await.unwrap();
    assert_eq!(replayed.body.as_ref(), body.as_slice());
    assert_eq!(replayed.state.attempt, 0);

    assert_eq!(ctx.process(&ctx.worker("worker-a"), replayed).await, Outcome::Succeeded);
    let payload = ctx.sink.results()[0].clone();
    assert_eq!(payload.resource_key, "rust streams");
}

/// A 429 waits out the provider's Retry-After, then counts as an attempt.
#[tokio::test(start_paused = true)]
async fn test_provider_rate_limit_consumes_an_attempt() {
    let ctx = TestContext::new(TaskKind::Phone, 100).await;
    ctx.executor
        .push(Err(ExecutorError::rate_limited(Some(Duration::from_secs(30)))));
    ctx.publish("Grace Hopper").await;

    let started = tokio::time::Instant::now();
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Retried);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(!ctx.lock_held("Grace Hopper").await, "lock released before waiting");

    let retried = ctx.receive().await.unwrap();
    assert_eq!(retried.state.attempt, 1);
    assert!(retried.state.last_error.as_deref().unwrap_or_default().contains("rate limited"));
}

/// A provider that keeps answering 429 still dead-letters eventually.
#[tokio::test(start_paused = true)]
async fn test_persistent_rate_limit_dead_letters() {
    let ctx = TestContext::new(TaskKind::Phone, 100).await;
    for _ in 0..3 {
        ctx.executor.push(Err(ExecutorError::rate_limited(None)));
    }
    ctx.publish("Grace Hopper").await;

    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Retried);
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Retried);
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::DeadLettered);
}

/// A sink failure after a successful call is retried; nothing is counted.
#[tokio::test]
async fn test_sink_failure_requeues_without_usage() {
    let ctx = TestContext::new(TaskKind::ShodanHost, 100).await;
    ctx.publish("1.1.1.1").await;

    ctx.sink.set_failing(true);
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Retried);
    assert_eq!(ctx.usage().await, 0);

    ctx.sink.set_failing(false);
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Succeeded);
    assert_eq!(ctx.usage().await, 1);
}

/// A worker that dies mid-execution leaves the message pending; reclaim hands
/// it to another worker with the abandoned attempt counted.
#[tokio::test]
async fn test_abandoned_delivery_is_reclaimed() {
    let ctx = TestContext::new(TaskKind::LeakCheck, 100).await;
    ctx.publish("crash@b.com").await;

    let abandoned = ctx.receive().await.unwrap();
    drop(abandoned);
    assert_eq!(ctx.pending(), 1);

    let reclaimed = ctx.broker.reclaim(&ctx.topology(), Duration::ZERO).await.unwrap();
    assert_eq!(reclaimed, 1);

    let redelivered = ctx.receive().await.unwrap();
    assert_eq!(redelivered.state.attempt, 1);
    assert_eq!(ctx.process(&ctx.worker("worker-b"), redelivered).await, Outcome::Succeeded);
    assert_eq!(ctx.sink.results()[0].attempts, 2);
}

/// A message that crashed every worker it reached is dead-lettered without
/// running again.
#[tokio::test]
async fn test_crash_looping_message_reaches_dead_letter() {
    let ctx = TestContext::new(TaskKind::LeakCheck, 100).await;
    ctx.publish("poison@b.com").await;

    for _ in 0..3 {
        ctx.receive().await.unwrap();
        ctx.broker.reclaim(&ctx.topology(), Duration::ZERO).await.unwrap();
    }

    assert_eq!(ctx.step(&ctx.worker("worker-z")).await, Outcome::DeadLettered);
    assert_eq!(ctx.executor.call_count(), 0);
    let dead = ctx.broker.dead_letters(&ctx.topology(), 1).await.unwrap();
    assert_eq!(dead[0].record.attempts, 3);
    assert!(dead[0].record.reason.contains("abandoned"));
}

/// With the store down every message is deferred, none is executed.
#[tokio::test]
async fn test_store_outage_fails_closed() {
    let ctx = TestContext::new(TaskKind::Serp, 100).await;
    ctx.publish("q").await;
    ctx.store.set_offline(true);

    assert!(matches!(
        ctx.step(&ctx.worker("worker-a")).await,
        Outcome::Deferred(_)
    ));
    assert_eq!(ctx.executor.call_count(), 0);

    ctx.store.set_offline(false);
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Succeeded);
}

/// A cache hit whose result cannot be stored is retried like any sink
/// failure, still without calling the provider.
#[tokio::test]
async fn test_cache_hit_with_failing_sink_is_retried() {
    let ctx = TestContext::with_spec(TaskKind::ShodanHost, |spec| {
        spec.daily_limit(10).cache_ttl(Duration::from_secs(3600))
    })
    .await;
    ctx.publish("9.9.9.9").await;
    ctx.publish("9.9.9.9").await;
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Succeeded);

    ctx.sink.set_failing(true);
    assert_eq!(ctx.step(&ctx.worker("worker-a")).await, Outcome::Retried);
    let retried = ctx.receive().await.unwrap();
    assert_eq!(retried.state.attempt, 1);

    ctx.sink.set_failing(false);
    assert_eq!(ctx.process(&ctx.worker("worker-a"), retried).await, Outcome::Cached);
    assert_eq!(ctx.executor.call_count(), 1);
    assert_eq!(ctx.usage().await, 1);
}
