#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use actors::{ExecutionError, ExecutionFuture, ExecutionOutput, ExecutionRequest, FnExecutor};
use api::{
    GatewayError, JobEvent, JobStatus, RateLimitConfig, RateLimiter, Submission, SubmissionGateway,
};
use bytes::Bytes;
use chrono::Utc;
use common::TestResult;
use db::{JobFilter, JobStore, ResultCache};
use jobs_core::{CacheEntry, ErrorKind, JobId, JobKind, ValidationError};
use serde_json::json;
use storage::ResultStorage;
use tokio::sync::broadcast;

#[tokio::test]
async fn module_detection_job_completes_and_is_served_from_cache() -> TestResult {
    let system = common::started(RateLimitConfig::default(), common::echo_executor()).await?;
    let gateway = system.gateway();
    let params = json!({"seed_genes": ["A", "B"], "k": 5});

    let submission = gateway
        .submit("10.0.0.1", &common::module_detection(), &params)
        .await?;
    let Submission::Queued {
        job_id,
        deduplicated,
    } = submission
    else {
        return Err(format!("expected a queued job, got {submission:?}").into());
    };
    assert!(!deduplicated);
    // A fast worker may already be done.
    let status = gateway.status(job_id).await?.status;
    assert!(status.is_in_flight() || status == JobStatus::Completed);

    let done = common::wait_until_finished(gateway, job_id).await?;
    assert_eq!(done.status, JobStatus::Completed);
    let result_ref = done.result_ref.ok_or("completed job has no result")?;
    assert!(!result_ref.is_empty());
    assert!(done.started_at.is_some() && done.finished_at.is_some());

    let output: serde_json::Value = serde_json::from_slice(&gateway.result(job_id).await?)?;
    assert_eq!(output, json!({"seed_genes": ["A", "B"], "k": 5}));

    // The cache entry is written right after the completion record.
    let mut again = gateway.submit("10.0.0.1", &common::module_detection(), &params).await?;
    for _ in 0..40 {
        if again.is_cached() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        again = gateway.submit("10.0.0.1", &common::module_detection(), &params).await?;
    }
    assert_eq!(
        again,
        Submission::Cached {
            job_id,
            result_ref: result_ref.clone(),
        }
    );
    assert_eq!(&gateway.result_by_ref(&result_ref).await?[..], &gateway.result(job_id).await?[..]);

    system.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn identical_submissions_join_the_in_flight_job() -> TestResult {
    let system = common::connected(RateLimitConfig::default()).await?;
    let gateway = system.gateway();
    let mut events = system.subscribe();

    let first = gateway
        .submit(
            "alice",
            &common::module_detection(),
            &json!({"seed_genes": ["A", "B"], "k": 5}),
        )
        .await?;
    // Same request with other key order, seed case and number form.
    let second = gateway
        .submit(
            "bob",
            &common::module_detection(),
            &json!({"k": 5.0, "seed_genes": ["b", "a", "A"]}),
        )
        .await?;

    assert_eq!(first.job_id(), second.job_id());
    assert_eq!(
        second,
        Submission::Queued {
            job_id: first.job_id(),
            deduplicated: true,
        }
    );
    assert_eq!(gateway.status(first.job_id()).await?.status, JobStatus::Queued);

    assert!(matches!(events.try_recv()?, JobEvent::Submitted { .. }));
    assert!(matches!(events.try_recv()?, JobEvent::Deduplicated { job_id, .. } if job_id == first.job_id()));
    Ok(())
}

#[tokio::test]
async fn concurrent_identical_submissions_create_one_job() -> TestResult {
    let system = common::connected(RateLimitConfig::default()).await?;
    let params = json!({"seed_genes": ["TP53", "BRCA1"], "k": 3});

    let submissions = futures_util::future::join_all((0..10).map(|n| {
        let gateway = system.gateway().clone();
        let params = params.clone();
        async move {
            gateway
                .submit(&format!("client-{n}"), &common::module_detection(), &params)
                .await
        }
    }))
    .await;

    let ids: Vec<JobId> = submissions
        .into_iter()
        .map(|s| s.map(|s| s.job_id()))
        .collect::<Result<_, _>>()?;
    assert!(ids.iter().all(|id| *id == ids[0]));
    Ok(())
}

#[tokio::test]
async fn rate_limit_rejects_the_request_over_the_limit() -> TestResult {
    let system = common::connected(RateLimitConfig::fixed(2, 3600)).await?;
    let gateway = system.gateway();
    let mut events = system.subscribe();

    for k in 1..=2 {
        gateway
            .submit("10.0.0.7", &common::module_detection(), &json!({"seed_genes": ["A"], "k": k}))
            .await?;
    }

    let rejected = gateway
        .submit("10.0.0.7", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 3}))
        .await;
    match rejected {
        Err(err @ GatewayError::RateLimitExceeded { .. }) => assert!(err.is_retryable()),
        other => return Err(format!("expected a rate limit rejection, got {other:?}").into()),
    }

    let mut submitted = 0;
    let mut limited = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::Submitted { .. } => submitted += 1,
            JobEvent::RateLimited { identity, .. } => {
                assert_eq!(identity, "10.0.0.7");
                limited += 1;
            }
            _ => {}
        }
    }
    assert_eq!((submitted, limited), (2, 1));

    // Other callers keep their own budget.
    gateway
        .submit("10.0.0.8", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 3}))
        .await?;

    // Admission resumes once the window has passed.
    let next_window = Utc::now() + chrono::Duration::seconds(3600);
    assert!(system.limiter().allow_at("10.0.0.7", next_window).await);
    Ok(())
}

#[tokio::test]
async fn disabled_rate_limit_admits_everything() -> TestResult {
    let system = common::connected(RateLimitConfig::disabled()).await?;
    for k in 1..=25 {
        system
            .gateway()
            .submit("10.0.0.9", &common::module_detection(), &json!({"seed_genes": ["A"], "k": k}))
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn cache_hits_are_not_rate_limited() -> TestResult {
    let system = common::started(RateLimitConfig::fixed(1, 3600), common::echo_executor()).await?;
    let gateway = system.gateway();
    let params = json!({"seed_genes": ["A"], "k": 1});

    let first = gateway.submit("carol", &common::module_detection(), &params).await?;
    common::wait_until_finished(gateway, first.job_id()).await?;

    let mut cached = false;
    for _ in 0..40 {
        match gateway.submit("carol", &common::module_detection(), &params).await {
            Ok(Submission::Cached { job_id, .. }) => {
                assert_eq!(job_id, first.job_id());
                cached = true;
                break;
            }
            // Completed but not yet cached; counts against the limit.
            Err(GatewayError::RateLimitExceeded { .. }) => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            other => return Err(format!("unexpected submission result {other:?}").into()),
        }
    }
    assert!(cached);

    let fresh = gateway
        .submit("carol", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 2}))
        .await;
    assert!(matches!(fresh, Err(GatewayError::RateLimitExceeded { .. })));

    system.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_submissions_create_no_job() -> TestResult {
    let system = common::connected(RateLimitConfig::fixed(1, 3600)).await?;
    let gateway = system.gateway();
    let mut events = system.subscribe();

    let unknown = gateway.submit("dave", &JobKind::from("bicon"), &json!({})).await;
    assert!(matches!(
        unknown,
        Err(GatewayError::Validation(ValidationError::UnknownKind(kind))) if kind == "bicon"
    ));

    let missing = gateway
        .submit("dave", &common::module_detection(), &json!({"seed_genes": ["A"]}))
        .await;
    assert!(matches!(
        missing,
        Err(GatewayError::Validation(ValidationError::MissingField(field))) if field == "k"
    ));

    let not_object = gateway
        .submit("dave", &common::module_detection(), &json!(["A", "B"]))
        .await;
    assert!(matches!(
        not_object,
        Err(GatewayError::Validation(ValidationError::NotAnObject))
    ));
    assert!(events.try_recv().is_err());

    // Rejected requests did not use up the budget.
    gateway
        .submit("dave", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 1}))
        .await?;
    Ok(())
}

#[tokio::test]
async fn result_is_refused_until_the_job_completes() -> TestResult {
    let system = common::connected(RateLimitConfig::default()).await?;
    let gateway = system.gateway();

    let submission = gateway
        .submit("erin", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 2}))
        .await?;
    let job_id = submission.job_id();

    match gateway.result(job_id).await {
        Err(GatewayError::NotReady { status, .. }) => assert_eq!(status, JobStatus::Queued),
        other => return Err(format!("expected not ready, got {other:?}").into()),
    }

    let cancelled = gateway.cancel(job_id).await?;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert!(cancelled.cancel_requested);

    match gateway.result(job_id).await {
        Err(GatewayError::Failed { error, .. }) => assert_eq!(error.kind, ErrorKind::Cancelled),
        other => return Err(format!("expected the failure, got {other:?}").into()),
    }

    // Cancelling a finished job changes nothing.
    assert_eq!(gateway.cancel(job_id).await?.status, JobStatus::Failed);

    let missing = JobId::new();
    assert!(matches!(gateway.status(missing).await, Err(GatewayError::NotFound(id)) if id == missing));
    assert!(matches!(gateway.cancel(missing).await, Err(GatewayError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn failed_jobs_are_reported_and_not_cached() -> TestResult {
    let executor = Arc::new(FnExecutor::new(|_request: ExecutionRequest| -> ExecutionFuture {
        Box::pin(async {
            Err(ExecutionError::NonZeroExit {
                code: Some(1),
                stderr: "no seeds found in network".to_string(),
            })
        })
    }));
    let system = common::started(RateLimitConfig::default(), executor).await?;
    let gateway = system.gateway();
    let params = json!({"seed_genes": ["XYZ"], "k": 1});

    let first = gateway.submit("frank", &common::module_detection(), &params).await?;
    let done = common::wait_until_finished(gateway, first.job_id()).await?;
    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.ok_or("failed job has no error")?;
    assert_eq!(error.kind, ErrorKind::Execution);
    assert_eq!(error.exit_code, Some(1));
    assert!(done.result_ref.is_none());

    // A failure is never served from cache; resubmitting runs again.
    let second = gateway.submit("frank", &common::module_detection(), &params).await?;
    assert!(!second.is_cached());
    assert_ne!(second.job_id(), first.job_id());

    system.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn running_job_is_cancelled_by_its_worker() -> TestResult {
    let executor = Arc::new(FnExecutor::new(|_request: ExecutionRequest| -> ExecutionFuture {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ExecutionOutput::text("too late"))
        })
    }));
    let system = common::started(RateLimitConfig::default(), executor).await?;
    let gateway = system.gateway();

    let submission = gateway
        .submit("grace", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 9}))
        .await?;
    let job_id = submission.job_id();

    for _ in 0..200 {
        if gateway.status(job_id).await?.status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let requested = gateway.cancel(job_id).await?;
    assert!(requested.cancel_requested);

    let done = common::wait_until_finished(gateway, job_id).await?;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.map(|e| e.kind), Some(ErrorKind::Cancelled));

    system.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reset_clears_instance_state_and_is_idempotent() -> TestResult {
    let system = common::connected(RateLimitConfig::fixed(2, 3600)).await?;
    let gateway = system.gateway();

    let mut ids = Vec::new();
    for k in 1..=2 {
        let submission = gateway
            .submit("heidi", &common::module_detection(), &json!({"seed_genes": ["A"], "k": k}))
            .await?;
        ids.push(submission.job_id());
    }

    let report = system.admin().reset().await?;
    let mut expired = report.expired_jobs.clone();
    expired.sort();
    ids.sort();
    assert_eq!(expired, ids);

    for id in &ids {
        let status = gateway.status(*id).await?;
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.error.map(|e| e.kind), Some(ErrorKind::Expired));
    }

    let again = system.admin().reset().await?;
    assert!(again.expired_jobs.is_empty());
    assert_eq!(again.purged_entries, 0);

    // Counters were cleared, and the expired job no longer blocks a resubmit.
    let resubmitted = gateway
        .submit("heidi", &common::module_detection(), &json!({"seed_genes": ["A"], "k": 1}))
        .await?;
    assert!(!ids.contains(&resubmitted.job_id()));
    Ok(())
}

#[tokio::test]
async fn reset_drops_cached_results() -> TestResult {
    let system = common::started(RateLimitConfig::disabled(), common::echo_executor()).await?;
    let gateway = system.gateway();
    let params = json!({"seed_genes": ["A"], "k": 4});

    let first = gateway.submit("ivan", &common::module_detection(), &params).await?;
    common::wait_until_finished(gateway, first.job_id()).await?;
    let mut cached = false;
    for _ in 0..40 {
        if gateway.submit("ivan", &common::module_detection(), &params).await?.is_cached() {
            cached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(cached);

    system.admin().reset().await?;

    let after = gateway.submit("ivan", &common::module_detection(), &params).await?;
    assert!(!after.is_cached());
    assert_ne!(after.job_id(), first.job_id());

    system.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn queue_stats_report_the_broker_queues() -> TestResult {
    let connected = common::connected(RateLimitConfig::default()).await?;
    assert!(connected.gateway().queue_stats().await?.is_empty());

    let system = common::started(RateLimitConfig::default(), common::echo_executor()).await?;
    let stats = system.gateway().queue_stats().await?;
    assert!(stats.iter().all(|s| s.pending == 0));
    assert_eq!(
        system.gateway().kinds(),
        vec![(common::module_detection(), jobs_core::QueueName::default_queue())]
    );

    system.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn submission_between_completion_and_caching_reuses_the_result() -> TestResult {
    let config = common::config(RateLimitConfig::disabled());
    let db = db::init(&config.db).await?;
    let jobs = JobStore::new(db.clone());
    let cache = ResultCache::new(db, config.cache);
    let storage = ResultStorage::new(config.storage.clone()).await?;
    let (events, _) = broadcast::channel(16);
    let gateway = SubmissionGateway::new(
        Arc::new(config.kind_registry()),
        jobs.clone(),
        cache.clone(),
        storage.clone(),
        Arc::new(RateLimiter::disabled()),
        events,
    );
    let kind = common::module_detection();
    let params = json!({"seed_genes": ["A", "B"], "k": 2});

    let first = gateway.submit("dave", &kind, &params).await?;
    let job_id = first.job_id();

    // A worker stores the output and records completion, then stalls
    // before writing the cache entry.
    jobs.claim(job_id, "w-1").await?.ok_or("claim")?;
    let result_ref = storage
        .put_result(&kind, job_id, "json", Bytes::from_static(b"{\"module\": []}"))
        .await?;
    let done = jobs
        .complete(job_id, "w-1", &result_ref)
        .await?
        .ok_or("complete")?;

    let second = gateway.submit("erin", &kind, &params).await?;
    assert_eq!(
        second,
        Submission::Cached {
            job_id,
            result_ref: result_ref.clone(),
        }
    );
    assert_eq!(jobs.list(JobFilter::default()).await?.len(), 1);

    let entry = cache
        .get(&kind, &done.fingerprint)
        .await?
        .ok_or("result was not cached")?;
    assert_eq!(entry.job_id, job_id);

    // The stalled worker's own write then finds the entry in place.
    let late = CacheEntry::new(kind.clone(), done.fingerprint.clone(), result_ref, job_id);
    assert!(!cache.put(&late).await?);
    assert!(gateway.submit("frank", &kind, &params).await?.is_cached());
    Ok(())
}
