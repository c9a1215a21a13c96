//! Job lifecycle tests
//!
//! Drive submissions through the orchestrator with scripted pipeline steps
//! and check job records, cache tiers and published progress.

mod common;

use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{BERN, ConverterBehaviour, Harness, ScriptedFetcher, ZURICH, request, test_config};
use pointcloud_proxy::{
    errors::{AppError, ErrorClass},
    job_scheduling::{JobHandler, JobOutcome, JobStatus},
    services::result_url,
    tiles::ProjectedBounds,
};

#[tokio::test]
async fn test_pending_job_becomes_ready_with_both_tiers() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let orchestrator = &harness.app.orchestrator;

    let outcome = orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Pending);
    assert!(!outcome.deduplicated);
    assert_eq!(
        outcome.tile_id,
        orchestrator.grid().tile_for_point(BERN.0, BERN.1).tile_id
    );

    assert_eq!(harness.drain().await, 1);

    let job = harness.record(outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.result_url.as_deref(), Some(result_url(&outcome.tile_id).as_str()));

    let entry = harness.app.cache.get(&outcome.tile_id).await.unwrap().unwrap();
    assert!(entry.raw.size_bytes > 0);
    assert!(entry.converted.as_ref().is_some_and(|c| c.size_bytes > 0));
    assert!(harness.app.cache.is_converted_ready(&outcome.tile_id).await.unwrap());

    let status = orchestrator.status(outcome.job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Ready);
    assert_eq!(status.result_url, job.result_url);
}

#[tokio::test]
async fn test_cached_tile_is_ready_without_fetching() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let orchestrator = &harness.app.orchestrator;

    orchestrator.submit(request("first", BERN)).await.unwrap();
    harness.drain().await;
    assert_eq!(harness.fetcher.calls(), 1);

    let outcome = orchestrator.submit(request("second", BERN)).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Ready);
    assert_eq!(harness.drain().await, 0);
    assert_eq!(harness.fetcher.calls(), 1);
    assert_eq!(harness.converter.calls(), 1);

    let status = orchestrator.status(outcome.job_id).await.unwrap();
    assert_eq!(status.progress, 100.0);
    assert!(status.message.contains("cache"));
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let harness = Harness::new(ScriptedFetcher::failing(2), ConverterBehaviour::Succeed).await;

    let outcome = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(harness.drain().await, 3);

    let job = harness.record(outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_class, None);
    assert_eq!(harness.fetcher.calls(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_end_in_error() {
    let harness = Harness::new(
        ScriptedFetcher::failing(usize::MAX),
        ConverterBehaviour::Succeed,
    )
    .await;

    let outcome = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    harness.drain().await;

    let job = harness.record(outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_class, Some(ErrorClass::Transient));
    assert!(job.message.contains("gave up after 3 attempts"), "{}", job.message);
    assert_eq!(harness.fetcher.calls(), 3);
    assert!(!harness.app.cache.has_raw(&outcome.tile_id).await.unwrap());
}

#[tokio::test]
async fn test_missing_descriptor_fails_without_retry() {
    let harness =
        Harness::new(ScriptedFetcher::default(), ConverterBehaviour::SkipDescriptor).await;

    let outcome = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(harness.drain().await, 1);

    let job = harness.record(outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error_class, Some(ErrorClass::InternalConsistency));
    assert_eq!(harness.converter.calls(), 1);

    // Neither tier survives, so the next request starts clean
    let cache = &harness.app.cache;
    assert!(!cache.has_raw(&outcome.tile_id).await.unwrap());
    assert!(!cache.is_converted_ready(&outcome.tile_id).await.unwrap());
    assert!(cache.get(&outcome.tile_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_converter_crash_is_permanent() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Crash).await;

    let outcome = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(harness.drain().await, 1);

    let job = harness.record(outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error_class, Some(ErrorClass::PermanentInput));
    assert!(!job.message.contains("gave up"));
}

#[tokio::test]
async fn test_job_timeout_fails_and_cleans_up() {
    let cache_dir = TempDir::new().unwrap();
    let mut config = test_config(cache_dir.path());
    config.jobs.job_timeout = Duration::from_millis(50);
    let harness = Harness::with_config(
        config,
        cache_dir,
        ScriptedFetcher::slow(Duration::from_secs(5)),
        ConverterBehaviour::Succeed,
    )
    .await;

    let outcome = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(harness.drain().await, 1);

    let job = harness.record(outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error_class, Some(ErrorClass::Transient));
    assert_eq!(job.attempts, 1);
    assert!(job.message.contains("too long"), "{}", job.message);

    let cache = &harness.app.cache;
    let partial = format!("{}.part", cache.raw_artifact(&outcome.tile_id));
    assert!(!cache.sandbox().exists(&partial).await.unwrap());
    assert!(!cache.has_raw(&outcome.tile_id).await.unwrap());
    assert!(
        !cache
            .sandbox()
            .exists(&cache.converted_dir(&outcome.tile_id))
            .await
            .unwrap()
    );

    // The dedup claim is gone, so the session can ask again
    let again = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert!(!again.deduplicated);
    assert_ne!(again.job_id, outcome.job_id);
}

#[tokio::test]
async fn test_second_session_waits_for_tile_in_progress() {
    let harness = Harness::new(
        ScriptedFetcher::slow(Duration::from_millis(300)),
        ConverterBehaviour::Succeed,
    )
    .await;
    let orchestrator = harness.app.orchestrator.clone();
    let queue = orchestrator.queue();

    orchestrator.submit(request("s1", BERN)).await.unwrap();
    let other = orchestrator.submit(request("s2", BERN)).await.unwrap();
    assert!(!other.deduplicated);

    let leader = queue.claim_next().await.unwrap().unwrap();
    let follower = queue.claim_next().await.unwrap().unwrap();
    let (leader_id, follower_id) = (leader.job_id, follower.job_id);

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(leader).await })
    };
    // The fetch starts only once the leader holds the tile lock
    for _ in 0..200 {
        if harness.fetcher.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.fetcher.calls(), 1);

    let outcome = orchestrator.execute(follower).await;
    assert!(matches!(outcome, JobOutcome::RetryAt(_)));
    let waiting = harness.record(follower_id).await;
    assert_eq!(waiting.attempts, 0);
    assert!(waiting.message.contains("Waiting for tile"), "{}", waiting.message);
    let status = orchestrator.status(follower_id).await.unwrap();
    assert!(status.message.contains("Waiting for tile"));

    assert!(matches!(running.await.unwrap(), JobOutcome::Finished));
    queue.complete(leader_id).await.unwrap();
    queue.requeue_at(follower_id, chrono::Utc::now()).await.unwrap();
    assert_eq!(harness.drain().await, 1);

    let follower = harness.record(follower_id).await;
    assert_eq!(follower.status, JobStatus::Ready);
    assert_eq!(follower.attempts, 0);
    assert_eq!(harness.fetcher.calls(), 1);
    assert_eq!(harness.converter.calls(), 1);
    assert_eq!(harness.record(leader_id).await.status, JobStatus::Ready);
}

#[tokio::test]
async fn test_duplicate_submission_returns_live_job() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let orchestrator = &harness.app.orchestrator;

    let first = orchestrator.submit(request("s1", BERN)).await.unwrap();
    let second = orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(first.job_id, second.job_id);
    assert!(second.deduplicated);

    // Another session gets its own job but shares the work
    let other = orchestrator.submit(request("s2", BERN)).await.unwrap();
    assert_ne!(other.job_id, first.job_id);
    assert!(!other.deduplicated);

    harness.drain().await;
    assert_eq!(harness.fetcher.calls(), 1);
    assert_eq!(harness.record(first.job_id).await.status, JobStatus::Ready);
    assert_eq!(harness.record(other.job_id).await.status, JobStatus::Ready);

    // Once the job is terminal the same session may submit again
    let again = orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_ne!(again.job_id, first.job_id);
    assert_eq!(again.status, JobStatus::Ready);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_ready() {
    let harness = Harness::new(ScriptedFetcher::failing(1), ConverterBehaviour::Succeed).await;
    let orchestrator = &harness.app.orchestrator;
    let mut events = orchestrator.progress().subscribe("watcher").await;

    let outcome = orchestrator.submit(request("watcher", BERN)).await.unwrap();
    harness.drain().await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, outcome.job_id);
        received.push(event);
    }
    assert!(received.len() >= 3, "expected several events, got {}", received.len());
    assert_eq!(received[0].status, JobStatus::Pending);
    for pair in received.windows(2) {
        assert!(
            pair[1].progress >= pair[0].progress,
            "progress went from {} to {}",
            pair[0].progress,
            pair[1].progress
        );
    }
    let last = received.last().unwrap();
    assert_eq!(last.status, JobStatus::Ready);
    assert_eq!(last.progress, 100.0);
    assert!(received.iter().any(|e| e.message.contains("retrying")));
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let orchestrator = &harness.app.orchestrator;

    let outside = orchestrator.submit(request("s1", (51.5, -0.12))).await;
    assert!(matches!(outside, Err(AppError::Validation { .. })));

    let not_finite = orchestrator.submit(request("s1", (f64::NAN, 7.0))).await;
    assert!(matches!(not_finite, Err(AppError::Validation { .. })));

    let blank_session = orchestrator.submit(request("  ", BERN)).await;
    assert!(matches!(blank_session, Err(AppError::Validation { .. })));

    let mut far_crop = request("s1", BERN);
    far_crop.crop_bbox = Some(ProjectedBounds::from_corners(
        2_700_000.0,
        1_250_000.0,
        2_700_100.0,
        1_250_100.0,
    ));
    assert!(matches!(
        orchestrator.submit(far_crop).await,
        Err(AppError::Validation { .. })
    ));

    assert_eq!(harness.drain().await, 0);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let result = harness.app.orchestrator.status(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(AppError::NotFound { .. })));
}

#[tokio::test]
async fn test_availability_reports_tiers() {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let orchestrator = &harness.app.orchestrator;

    let before = orchestrator.availability(BERN.0, BERN.1).await.unwrap();
    assert!(before.coverage_available);
    assert!(!before.raw_cached && !before.converted_cached);

    orchestrator.submit(request("s1", BERN)).await.unwrap();
    harness.drain().await;

    let after = orchestrator.availability(BERN.0, BERN.1).await.unwrap();
    assert!(after.raw_cached && after.converted_cached);

    let outside = orchestrator.availability(51.5, -0.12).await.unwrap();
    assert!(!outside.coverage_available);
}

#[tokio::test]
async fn test_sweeper_evicts_least_recently_used_tile() {
    let cache_dir = TempDir::new().unwrap();
    let mut config = test_config(cache_dir.path());
    config.storage.max_cache_bytes = 100;
    config.eviction.safety_margin = Duration::ZERO;
    let harness = Harness::with_config(
        config,
        cache_dir,
        ScriptedFetcher::default(),
        ConverterBehaviour::Succeed,
    )
    .await;
    let orchestrator = &harness.app.orchestrator;

    let bern = orchestrator.submit(request("s1", BERN)).await.unwrap();
    harness.drain().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let zurich = orchestrator.submit(request("s1", ZURICH)).await.unwrap();
    harness.drain().await;

    let result = harness.app.sweeper.sweep().await.unwrap();
    assert_eq!(result.entries_evicted, 1);
    assert!(result.size_after <= result.size_before);

    let cache = &harness.app.cache;
    assert!(!cache.is_converted_ready(&bern.tile_id).await.unwrap());
    assert!(cache.is_converted_ready(&zurich.tile_id).await.unwrap());
    assert_eq!(cache.list_ordered_by_recency().await.unwrap(), vec![zurich.tile_id]);
}

#[tokio::test]
async fn test_reconcile_restores_cache_after_restart() {
    let cache_dir = TempDir::new().unwrap();
    let config = test_config(cache_dir.path());
    let first = Harness::with_config(
        config.clone(),
        TempDir::new().unwrap(),
        ScriptedFetcher::default(),
        ConverterBehaviour::Succeed,
    )
    .await;
    let outcome = first.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    first.drain().await;

    // A fresh store over the same directory knows nothing until reconciled
    let second = Harness::with_config(
        config,
        cache_dir,
        ScriptedFetcher::default(),
        ConverterBehaviour::Succeed,
    )
    .await;
    let entry = second.app.cache.get(&outcome.tile_id).await.unwrap().unwrap();
    assert!(entry.is_converted());

    let again = second.app.orchestrator.submit(request("s1", BERN)).await.unwrap();
    assert_eq!(again.status, JobStatus::Ready);
    assert_eq!(second.fetcher.calls(), 0);
}

#[tokio::test]
async fn test_background_runner_completes_jobs() {
    let harness = Harness::new(ScriptedFetcher::failing(1), ConverterBehaviour::Succeed).await;
    let token = CancellationToken::new();
    let handles = harness.app.spawn_background(&token);

    let outcome = harness.app.orchestrator.submit(request("s1", BERN)).await.unwrap();

    let mut status = JobStatus::Pending;
    for _ in 0..200 {
        status = harness.app.orchestrator.status(outcome.job_id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, JobStatus::Ready);
    assert_eq!(harness.fetcher.calls(), 2);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    let stats = harness.app.orchestrator.queue().stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);
}
