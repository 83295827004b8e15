//! Execution of the external computation behind a job.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use jobs_core::{ErrorKind, JobError, JobId, JobKind};
use serde_json::Value;
use tokio::process::Command;

use crate::kinds::{KindRegistry, OutputFormat};

/// Longest stderr tail kept on a failed run.
const STDERR_TAIL: usize = 4096;

/// Input for one run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub kind: JobKind,
    pub params: Value,
    pub timeout: Duration,
}

/// Output of a successful run.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub bytes: Bytes,
    /// File extension the output is stored with.
    pub extension: String,
}

impl ExecutionOutput {
    pub fn json(value: &Value) -> Self {
        Self {
            bytes: Bytes::from(value.to_string()),
            extension: "json".to_string(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            bytes: Bytes::from(text.into()),
            extension: "txt".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("no executor configured for kind {0}")]
    UnknownKind(JobKind),

    #[error("failed to start computation: {0}")]
    Spawn(String),

    #[error("computation exited with {}: {stderr}", .code.map_or("a signal".to_string(), |c| format!("code {c}")))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("computation exceeded {0:?} and was terminated")]
    Timeout(Duration),

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecutionError> for JobError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Timeout(timeout) => JobError::timeout(timeout.as_secs()),
            ExecutionError::NonZeroExit { code, ref stderr } => {
                let error = JobError::new(ErrorKind::Execution, stderr.trim().to_string());
                match code {
                    Some(code) => error.with_exit_code(code),
                    None => error,
                }
            }
            ExecutionError::MalformedOutput(_) => {
                JobError::new(ErrorKind::MalformedOutput, err.to_string())
            }
            ExecutionError::UnknownKind(_) | ExecutionError::Spawn(_) | ExecutionError::Io(_) => {
                JobError::new(ErrorKind::Execution, err.to_string())
            }
        }
    }
}

pub type ExecutionResult = Result<ExecutionOutput, ExecutionError>;

/// Future type returned by executors.
pub type ExecutionFuture = Pin<Box<dyn Future<Output = ExecutionResult> + Send>>;

/// Runs the computation for a job.
///
/// Dropping the returned future must stop the computation; the worker does
/// this on cancellation.
pub trait Executor: Send + Sync + 'static {
    fn run(&self, request: ExecutionRequest) -> ExecutionFuture;
}

/// Runs each kind as an external command in a scratch directory.
///
/// The normalized parameters are written to `params.json`, the command is
/// expected to write its result to `output.<ext>`. A run that exceeds its
/// timeout is killed.
pub struct CommandExecutor {
    kinds: Arc<KindRegistry>,
}

impl CommandExecutor {
    pub fn new(kinds: Arc<KindRegistry>) -> Self {
        Self { kinds }
    }
}

impl Executor for CommandExecutor {
    fn run(&self, request: ExecutionRequest) -> ExecutionFuture {
        let descriptor = self.kinds.get(&request.kind);
        Box::pin(async move {
            let descriptor =
                descriptor.ok_or_else(|| ExecutionError::UnknownKind(request.kind.clone()))?;

            let workdir = tempfile::Builder::new()
                .prefix(&format!("nedrex-{}-", request.kind))
                .tempdir()?;
            let params_path = workdir.path().join("params.json");
            let output_path = workdir
                .path()
                .join(format!("output.{}", descriptor.output.extension()));
            tokio::fs::write(&params_path, request.params.to_string()).await?;

            let job_id = request.job_id.to_string();
            let render = |arg: &str| {
                arg.replace("{params}", &params_path.display().to_string())
                    .replace("{output}", &output_path.display().to_string())
                    .replace("{workdir}", &workdir.path().display().to_string())
                    .replace("{job_id}", &job_id)
            };
            let args: Vec<String> = descriptor.command.args.iter().map(|a| render(a)).collect();

            tracing::debug!(
                job_id = %request.job_id,
                program = %descriptor.command.program,
                timeout_secs = request.timeout.as_secs(),
                "starting computation"
            );

            let stderr_path = workdir.path().join("stderr.log");
            let mut command = Command::new(&descriptor.command.program);
            command
                .args(&args)
                .current_dir(workdir.path())
                .stdin(Stdio::null())
                .stdout(Stdio::from(std::fs::File::create(workdir.path().join("stdout.log"))?))
                .stderr(Stdio::from(std::fs::File::create(&stderr_path)?))
                .kill_on_drop(true);
            // Own process group, so helpers the tool starts die with it.
            #[cfg(unix)]
            command.process_group(0);

            let mut child = command.spawn().map_err(|e| {
                ExecutionError::Spawn(format!("{}: {e}", descriptor.command.program))
            })?;
            let mut group = ProcessGroup::of(&child);

            let status = match tokio::time::timeout(request.timeout, child.wait()).await {
                Ok(status) => {
                    // Leftover helpers of a finished tool.
                    group.kill();
                    status?
                }
                Err(_) => {
                    tracing::warn!(job_id = %request.job_id, "computation timed out, killing it");
                    group.kill();
                    if let Err(err) = child.kill().await {
                        tracing::warn!(job_id = %request.job_id, "failed to reap timed out computation: {}", err);
                    }
                    return Err(ExecutionError::Timeout(request.timeout));
                }
            };

            if !status.success() {
                let stderr = tokio::fs::read(&stderr_path).await.unwrap_or_default();
                return Err(ExecutionError::NonZeroExit {
                    code: status.code(),
                    stderr: tail(&stderr),
                });
            }

            let bytes = read_output(&output_path, descriptor.output).await?;
            Ok(ExecutionOutput {
                bytes,
                extension: descriptor.output.extension().to_string(),
            })
        })
    }
}

/// Process group of a running computation, killed at most once: on exit,
/// on timeout, or when the worker drops the run future on cancellation.
/// The group id stays reserved while any member lives, so a late kill
/// cannot hit an unrelated process.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // SAFETY: plain syscall, a negative pid addresses the group.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pgid, "failed to kill process group: {}", err);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn read_output(path: &Path, format: OutputFormat) -> Result<Bytes, ExecutionError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecutionError::MalformedOutput(
                "computation produced no output file".to_string(),
            ));
        }
        Err(err) => return Err(err.into()),
    };

    match format {
        OutputFormat::Json => {
            serde_json::from_slice::<Value>(&bytes)
                .map_err(|e| ExecutionError::MalformedOutput(format!("invalid JSON: {e}")))?;
        }
        OutputFormat::Text => {
            std::str::from_utf8(&bytes)
                .map_err(|e| ExecutionError::MalformedOutput(format!("invalid UTF-8: {e}")))?;
        }
        OutputFormat::Graphml => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| ExecutionError::MalformedOutput(format!("invalid UTF-8: {e}")))?;
            if !text.contains("<graphml") {
                return Err(ExecutionError::MalformedOutput(
                    "output is not a GraphML document".to_string(),
                ));
            }
        }
    }

    Ok(Bytes::from(bytes))
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// A simple function-based executor.
pub struct FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> ExecutionFuture + Send + Sync + 'static,
{
    run: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> ExecutionFuture + Send + Sync + 'static,
{
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

impl<F> Executor for FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> ExecutionFuture + Send + Sync + 'static,
{
    fn run(&self, request: ExecutionRequest) -> ExecutionFuture {
        (self.run)(request)
    }
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::kinds::{CommandTemplate, KindDescriptor};
    use serde_json::json;
    use std::error::Error;

    fn executor_for(kind: &str, script: &str, output: OutputFormat) -> CommandExecutor {
        let descriptor = KindDescriptor::new(
            kind,
            CommandTemplate {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    script.to_string(),
                    "sh".to_string(),
                    "{params}".to_string(),
                    "{output}".to_string(),
                ],
            },
        )
        .with_output(output);
        CommandExecutor::new(Arc::new(KindRegistry::from_iter([descriptor])))
    }

    fn request(kind: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            job_id: JobId::new(),
            kind: JobKind::from(kind),
            params: json!({"seeds": ["2717"], "k": 5}),
            timeout,
        }
    }

    #[tokio::test]
    async fn command_reads_params_and_writes_output() -> Result<(), Box<dyn Error>> {
        let executor = executor_for("copy", r#"cp "$1" "$2""#, OutputFormat::Json);
        let output = executor.run(request("copy", Duration::from_secs(10))).await?;

        assert_eq!(output.extension, "json");
        let value: Value = serde_json::from_slice(&output.bytes)?;
        assert_eq!(value, json!({"k": 5, "seeds": ["2717"]}));
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() -> Result<(), Box<dyn Error>> {
        let executor = executor_for(
            "fail",
            "echo 'seed not in network' >&2; exit 3",
            OutputFormat::Text,
        );
        let err = executor
            .run(request("fail", Duration::from_secs(10)))
            .await
            .unwrap_err();

        let job_error = JobError::from(err);
        assert_eq!(job_error.kind, ErrorKind::Execution);
        assert_eq!(job_error.exit_code, Some(3));
        assert_eq!(job_error.message, "seed not in network");
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_invalid_output_is_malformed() -> Result<(), Box<dyn Error>> {
        let executor = executor_for("silent", "true", OutputFormat::Text);
        let err = executor
            .run(request("silent", Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MalformedOutput(_)));

        let executor = executor_for("garbled", r#"echo '{"nodes": [' > "$2""#, OutputFormat::Json);
        let err = executor
            .run(request("garbled", Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert_eq!(JobError::from(err).kind, ErrorKind::MalformedOutput);

        let executor = executor_for("tsv", r#"printf 'a\tb\n' > "$2""#, OutputFormat::Graphml);
        let err = executor
            .run(request("tsv", Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MalformedOutput(_)));
        Ok(())
    }

    #[tokio::test]
    async fn graphml_output_keeps_its_extension() -> Result<(), Box<dyn Error>> {
        let executor = executor_for(
            "graph",
            r#"echo '<graphml><graph edgedefault="undirected"/></graphml>' > "$2""#,
            OutputFormat::Graphml,
        );
        let output = executor.run(request("graph", Duration::from_secs(10))).await?;
        assert_eq!(output.extension, "graphml");
        assert!(output.bytes.starts_with(b"<graphml"));
        Ok(())
    }

    /// Zombies count as dead; nothing reaps them in a bare container.
    fn is_alive(pid: &str) -> std::io::Result<bool> {
        let stat = Path::new("/proc").join(pid.trim()).join("stat");
        if Path::new("/proc/self/stat").exists() {
            return Ok(match std::fs::read_to_string(stat) {
                Ok(stat) => stat
                    .rsplit_once(')')
                    .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
                Err(_) => false,
            });
        }
        Ok(std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .status()?
            .success())
    }

    async fn wait_for_pid(path: &Path) -> Result<String, Box<dyn Error>> {
        for _ in 0..100 {
            if let Ok(pid) = std::fs::read_to_string(path) {
                if !pid.trim().is_empty() {
                    return Ok(pid);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err("helper never wrote its pid".into())
    }

    #[tokio::test]
    async fn timeout_kills_helpers_started_by_the_tool() -> Result<(), Box<dyn Error>> {
        let pid_dir = tempfile::tempdir()?;
        let pid_file = pid_dir.path().join("pid");
        // The tool forks the real work and waits on it.
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let executor = executor_for("slow", &script, OutputFormat::Text);

        let started = std::time::Instant::now();
        let err = executor
            .run(request("slow", Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file)?;
        // SIGKILL delivery is asynchronous; give the kernel a moment.
        let mut alive = true;
        for _ in 0..50 {
            alive = is_alive(&pid)?;
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "helper {} survived the timeout", pid.trim());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_run_kills_helpers_started_by_the_tool() -> Result<(), Box<dyn Error>> {
        let pid_dir = tempfile::tempdir()?;
        let pid_file = pid_dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let executor = executor_for("cancelled", &script, OutputFormat::Text);

        let run = tokio::spawn(executor.run(request("cancelled", Duration::from_secs(60))));
        let pid = wait_for_pid(&pid_file).await?;
        assert!(is_alive(&pid)?);

        run.abort();
        let _ = run.await;

        let mut alive = true;
        for _ in 0..50 {
            alive = is_alive(&pid)?;
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "helper {} survived cancellation", pid.trim());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let executor = CommandExecutor::new(Arc::new(KindRegistry::new()));
        let err = executor
            .run(request("missing", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownKind(_)));
    }
}
