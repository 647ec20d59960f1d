//! Retry coordinator tests.
//!
//! All tests run on paused time, so backoff waits complete instantly while
//! the wall-clock deadline stays put.

use std::sync::atomic::Ordering;

use super::*;
use crate::collaborators::StatusCheckError;
use crate::test_utils::{RecordingNotifier, ScriptedUpstream, flaky_store, wait_until};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    store: StateStore,
    scheduler: Arc<SingletonScheduler>,
    upstream: Arc<ScriptedUpstream>,
    notifier: Arc<RecordingNotifier>,
    coordinators: Coordinators<ScriptedUpstream, RecordingNotifier>,
}

fn config() -> RelayConfig {
    RelayConfig::new()
        .with_backoff(BackoffConfig::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(900),
        ))
        .with_retry_timeout(Duration::from_secs(24 * 3600))
        .with_notify_threshold(3)
        .with_status_retry(RetryConfig::fixed(2, Duration::from_secs(5)))
        .with_notify_retry(RetryConfig::fixed(1, Duration::from_secs(1)))
}

fn harness_with(config: RelayConfig, store: StateStore, upstream: ScriptedUpstream) -> Harness {
    let scheduler = Arc::new(SingletonScheduler::new(config.start_retry));
    let upstream = Arc::new(upstream);
    let notifier = Arc::new(RecordingNotifier::new());
    let notifications = Notifications::new(
        &config,
        store.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&notifier),
    );
    let coordinators = Coordinators::new(
        &config,
        store.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&upstream),
        notifications,
    );
    Harness {
        store,
        scheduler,
        upstream,
        notifier,
        coordinators,
    }
}

fn harness(upstream: ScriptedUpstream) -> Harness {
    harness_with(config(), StateStore::in_memory(), upstream)
}

fn key() -> TableKey {
    TableKey::new("T1")
}

fn assert_waited(started: tokio::time::Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_secs(1),
        "waited {:?}, expected {:?}",
        elapsed,
        expected
    );
}

fn retry_state(store: &StateStore) -> Option<RetryState> {
    store.get::<RetryState>(key().as_str()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Generations
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn prepare_persists_seed_before_first_wait() {
    let h = harness(ScriptedUpstream::new());
    let coordinator = h.coordinators.prepare(&key()).unwrap();

    let persisted = retry_state(&h.store).unwrap();
    assert_eq!(persisted.attempt, 0);
    assert_eq!(&persisted, coordinator.state());
    assert_eq!(persisted.notify_threshold, 3);
}

#[tokio::test(start_paused = true)]
async fn continues_while_outstanding_then_stops() {
    let h = harness(ScriptedUpstream::new().then_pending(1));
    h.store
        .put(key().as_str(), &LastErrorRecord::new("connection reset", Utc::now()))
        .unwrap();
    let mut coordinator = h.coordinators.prepare(&key()).unwrap();

    assert_eq!(coordinator.step().await.unwrap(), Step::Continue);
    assert_eq!(retry_state(&h.store).unwrap().attempt, 1);

    assert_eq!(
        coordinator.step().await.unwrap(),
        Step::Stop(StopReason::NothingOutstanding)
    );
    assert_eq!(retry_state(&h.store).unwrap().attempt, 2);
    assert_eq!(h.upstream.checks(), 2);
}

#[tokio::test(start_paused = true)]
async fn run_clears_state_on_stop_and_keeps_last_error() {
    let h = harness(ScriptedUpstream::new().then_pending(1));
    h.store
        .put(key().as_str(), &LastErrorRecord::new("connection reset", Utc::now()))
        .unwrap();

    let coordinator = h.coordinators.prepare(&key()).unwrap();
    let reason = coordinator.run().await;

    assert_eq!(reason, Some(StopReason::NothingOutstanding));
    assert_eq!(retry_state(&h.store), None);
    let last_error = h.store.get::<LastErrorRecord>(key().as_str()).unwrap().unwrap();
    assert_eq!(last_error.message, "connection reset");
}

#[tokio::test(start_paused = true)]
async fn waits_follow_linear_capped_backoff() {
    let h = harness(ScriptedUpstream::new().then_pending(1).then_pending(1));
    let mut coordinator = h.coordinators.prepare(&key()).unwrap();

    let started = tokio::time::Instant::now();
    coordinator.step().await.unwrap();
    // attempt 1: 60s + 1 * 60s
    assert_waited(started, Duration::from_secs(120));

    let started = tokio::time::Instant::now();
    coordinator.step().await.unwrap();
    assert_waited(started, Duration::from_secs(180));
}

#[tokio::test(start_paused = true)]
async fn zero_backoff_still_waits_before_checking() {
    let backoff = BackoffConfig::new(Duration::ZERO, Duration::ZERO, Duration::ZERO);
    let h = harness_with(
        config().with_backoff(backoff),
        StateStore::in_memory(),
        ScriptedUpstream::new().then_pending(1),
    );
    let mut coordinator = h.coordinators.prepare(&key()).unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(coordinator.step().await.unwrap(), Step::Continue);
    assert_waited(started, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn timeout_takes_precedence_over_outstanding_work() {
    let h = harness(ScriptedUpstream::new().then_pending(5));
    let mut expired = RetryState::seed(
        Utc::now() - chrono::Duration::hours(25),
        Duration::from_secs(24 * 3600),
        config().backoff,
        3,
    );
    expired.attempt = 7;
    h.store.put(key().as_str(), &expired).unwrap();

    let reason = h.coordinators.prepare(&key()).unwrap().run().await;

    assert_eq!(reason, Some(StopReason::TimedOut));
    assert_eq!(h.upstream.checks(), 0);
    assert_eq!(retry_state(&h.store), None);
}

#[tokio::test(start_paused = true)]
async fn limit_reached_rearms_upstream() {
    let h = harness(ScriptedUpstream::new().then(Ok(OutstandingAttempts {
        count: 2,
        limit_reached: true,
    })));
    let mut coordinator = h.coordinators.prepare(&key()).unwrap();

    assert_eq!(coordinator.step().await.unwrap(), Step::Continue);
    assert_eq!(h.upstream.rearms(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn persistent_status_failure_stops() {
    let unavailable = || Err(StatusCheckError::Unavailable("connection refused".into()));
    let h = harness(
        ScriptedUpstream::new()
            .then(unavailable())
            .then(unavailable())
            .then(unavailable()),
    );

    let reason = h.coordinators.prepare(&key()).unwrap().run().await;

    assert_eq!(reason, Some(StopReason::StatusUnavailable));
    // Initial call plus two retries.
    assert_eq!(h.upstream.checks(), 3);
    assert_eq!(retry_state(&h.store), None);
}

#[tokio::test(start_paused = true)]
async fn transient_status_failure_is_retried_within_generation() {
    let h = harness(
        ScriptedUpstream::new()
            .then(Err(StatusCheckError::Unavailable("blip".into())))
            .then_pending(1),
    );
    let mut coordinator = h.coordinators.prepare(&key()).unwrap();

    assert_eq!(coordinator.step().await.unwrap(), Step::Continue);
    assert_eq!(h.upstream.checks(), 2);
    assert_eq!(coordinator.state().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_status_request_stops_immediately() {
    let h = harness(ScriptedUpstream::new().then(Err(StatusCheckError::Rejected("unknown key".into()))));

    let reason = h.coordinators.prepare(&key()).unwrap().run().await;

    assert_eq!(reason, Some(StopReason::StatusUnavailable));
    assert_eq!(h.upstream.checks(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Escalation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn threshold_notification_fires_exactly_once() {
    let mut upstream = ScriptedUpstream::new();
    for _ in 0..6 {
        upstream = upstream.then_pending(1);
    }
    let h = harness(upstream);
    h.store
        .put(key().as_str(), &LastErrorRecord::new("503 from sink", Utc::now()))
        .unwrap();

    let reason = h.coordinators.prepare(&key()).unwrap().run().await;
    assert_eq!(reason, Some(StopReason::NothingOutstanding));

    wait_until(|| !h.notifier.sent().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reason, NotifyReason::RetryThreshold);
    assert!(sent[0].message.contains("3 attempts"));
    assert!(sent[0].message.contains("503 from sink"));
}

#[tokio::test(start_paused = true)]
async fn resumed_coordinator_past_threshold_does_not_refire() {
    let h = harness(ScriptedUpstream::new().then_pending(1).then_pending(1));
    let mut state = RetryState::seed(Utc::now(), Duration::from_secs(24 * 3600), config().backoff, 3);
    state.attempt = 3;
    state.generation = 3;
    state.threshold_notified = true;
    h.store.put(key().as_str(), &state).unwrap();

    h.coordinators.prepare(&key()).unwrap().run().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(h.notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_threshold_never_notifies() {
    let mut upstream = ScriptedUpstream::new();
    for _ in 0..4 {
        upstream = upstream.then_pending(1);
    }
    let h = harness_with(config().with_notify_threshold(0), StateStore::in_memory(), upstream);

    h.coordinators.prepare(&key()).unwrap().run().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(h.notifier.sent().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Resumption
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn resumes_from_persisted_generation_without_recounting() {
    let h = harness(ScriptedUpstream::new().then_pending(1));
    let mut state = RetryState::seed(Utc::now(), Duration::from_secs(24 * 3600), config().backoff, 10);
    state.attempt = 4;
    state.generation = 4;
    h.store.put(key().as_str(), &state).unwrap();

    let mut coordinator = h.coordinators.prepare(&key()).unwrap();
    let started = tokio::time::Instant::now();
    assert_eq!(coordinator.step().await.unwrap(), Step::Continue);

    assert_eq!(coordinator.state().attempt, 4);
    assert_waited(started, Duration::from_secs(60 + 4 * 60));

    coordinator.step().await.unwrap();
    assert_eq!(retry_state(&h.store).unwrap().attempt, 5);
}

#[tokio::test(start_paused = true)]
async fn resumed_seed_counts_its_first_generation() {
    let h = harness(ScriptedUpstream::new().then_pending(1));
    // A crash right after the seed was persisted leaves generation 0 behind.
    h.coordinators.prepare(&key()).unwrap();

    let mut coordinator = h.coordinators.prepare(&key()).unwrap();
    let started = tokio::time::Instant::now();
    assert_eq!(coordinator.step().await.unwrap(), Step::Continue);

    assert_eq!(coordinator.state().attempt, 1);
    assert_eq!(coordinator.state().generation, 1);
    assert_waited(started, Duration::from_secs(120));
    assert_eq!(retry_state(&h.store).unwrap().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn resume_all_starts_one_coordinator_per_persisted_key() {
    let h = harness(ScriptedUpstream::new());
    for name in ["T1", "T2"] {
        let state = RetryState::seed(Utc::now(), Duration::from_secs(3600), config().backoff, 10);
        h.store.put(name, &state).unwrap();
    }

    let started = h.coordinators.resume_all().await.unwrap();

    assert_eq!(started, 2);
    assert!(
        h.scheduler
            .is_running(&InstanceKey::coordinator(&TableKey::new("T2")))
            .await
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn at_most_one_coordinator_per_key() {
    let h = harness(ScriptedUpstream::new().then_pending(1));

    let first = h.coordinators.ensure(&key()).await;
    let second = h.coordinators.ensure(&key()).await;

    assert_eq!(first, EnsureOutcome::Started);
    assert_eq!(second, EnsureOutcome::AlreadyRunning);
    assert_eq!(h.scheduler.running_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn finished_coordinator_frees_its_slot() {
    let h = harness(ScriptedUpstream::new());
    h.coordinators.ensure(&key()).await;

    // One generation: 120s wait, then nothing outstanding.
    tokio::time::sleep(Duration::from_secs(121)).await;

    assert_eq!(retry_state(&h.store), None);
    assert!(!h.scheduler.is_running(&InstanceKey::coordinator(&key())).await);
}

#[tokio::test(start_paused = true)]
async fn store_failure_exits_and_keeps_state() {
    let (store, broken) = flaky_store();
    let h = harness_with(config(), store, ScriptedUpstream::new().then_pending(1));
    let mut coordinator = h.coordinators.prepare(&key()).unwrap();
    coordinator.step().await.unwrap();

    broken.store(true, Ordering::SeqCst);
    assert_eq!(coordinator.run().await, None);

    broken.store(false, Ordering::SeqCst);
    assert_eq!(retry_state(&h.store).unwrap().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn start_fails_while_store_is_down() {
    let (store, broken) = flaky_store();
    let h = harness_with(config(), store, ScriptedUpstream::new());
    broken.store(true, Ordering::SeqCst);

    assert_eq!(h.coordinators.ensure(&key()).await, EnsureOutcome::GaveUp);
    assert_eq!(h.scheduler.running_count().await, 0);
}
