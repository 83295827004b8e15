#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{
    CommandTemplate, ExecutionFuture, ExecutionOutput, ExecutionRequest, Executor, FnExecutor,
    KindDescriptor, WorkerPool,
};
use api::{AppConfig, JobStatusDocument, JobSystem, RateLimitConfig, SubmissionGateway};
use db::DbConfig;
use jobs_core::{FieldSpec, FieldType, JobId, JobKind, ParamSchema, QueueName};
use storage::StorageConfig;

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

pub fn module_detection() -> JobKind {
    JobKind::from("module-detection")
}

/// In-memory instance with a single `module-detection` kind.
pub fn config(rate_limit: RateLimitConfig) -> AppConfig {
    let mut config = AppConfig {
        db: DbConfig::memory(),
        storage: StorageConfig::memory(),
        rate_limit,
        builtin_kinds: false,
        ..AppConfig::default()
    };
    config.kinds.push(
        KindDescriptor::new(
            "module-detection",
            CommandTemplate {
                program: "module-detection".to_string(),
                args: vec!["{params}".to_string(), "{output}".to_string()],
            },
        )
        .with_schema(ParamSchema::new(vec![
            FieldSpec::required("seed_genes", FieldType::Seeds { type_field: None }),
            FieldSpec::required(
                "k",
                FieldType::Integer {
                    min: Some(1),
                    max: None,
                },
            ),
        ])),
    );
    config.workers.pools = vec![WorkerPool::new(vec![QueueName::default_queue()], 2)];
    config.workers.poll_timeout_secs = 1;
    config.workers.cancel_check_secs = 1;
    config.workers.retry_backoff_ms = 50;
    config.workers.recovery_interval_secs = 1;
    config
}

/// Executor that writes the job parameters back as JSON.
pub fn echo_executor() -> Arc<dyn Executor> {
    Arc::new(FnExecutor::new(|request: ExecutionRequest| -> ExecutionFuture {
        Box::pin(async move { Ok(ExecutionOutput::json(&request.params)) })
    }))
}

pub async fn started(rate_limit: RateLimitConfig, executor: Arc<dyn Executor>) -> TestResult<JobSystem> {
    Ok(JobSystem::start_with_executor(&config(rate_limit), executor).await?)
}

/// Gateway and admin only; submitted jobs stay queued.
pub async fn connected(rate_limit: RateLimitConfig) -> TestResult<JobSystem> {
    Ok(JobSystem::connect(&config(rate_limit)).await?)
}

/// Poll the gateway until the job reaches a terminal status.
pub async fn wait_until_finished(gateway: &SubmissionGateway, id: JobId) -> TestResult<JobStatusDocument> {
    for _ in 0..200 {
        let status = gateway.status(id).await?;
        if status.status.is_terminal() {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(format!("job {id} did not finish").into())
}
