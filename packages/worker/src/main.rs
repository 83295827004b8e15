//! nedrex-jobs: worker process and admin tool for the analysis job system.
//!
//! `run` starts the broker and worker pools of one instance and serves jobs
//! until interrupted. The other subcommands connect to the same store
//! without starting workers.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use api::{AppConfig, JobSystem};
use clap::{Parser, Subcommand};
use jobs_core::{JobId, JobKind};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nedrex-jobs", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "NEDREX_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pools until interrupted.
    Run,
    /// Clear queue, cache and rate-limit state of this instance.
    Reset,
    /// Submit a job and print the outcome.
    Submit {
        kind: String,
        /// Parameters as a JSON object.
        #[arg(default_value = "{}")]
        params: String,
        /// Identity the rate limiter counts the request against.
        #[arg(long, default_value = "cli")]
        identity: String,
    },
    /// Print the status document of a job.
    Status { job_id: String },
    /// Write the result of a completed job to stdout or a file.
    Result {
        job_id: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Request cancellation of a job.
    Cancel { job_id: String },
    /// List registered job kinds.
    Kinds,
}

fn parse_job_id(raw: &str) -> anyhow::Result<JobId> {
    JobId::parse(raw).with_context(|| format!("invalid job id: {raw}"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: &AppConfig) -> anyhow::Result<()> {
    let system = JobSystem::start(config)
        .await
        .context("failed to start the job system")?;

    let mut events = system.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("{}", event.description()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event log skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("Serving jobs; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    system.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Command::Run => run(&config).await,
        command => client(&config, command).await,
    }
}

/// One-shot commands against the store, without workers.
async fn client(config: &AppConfig, command: Command) -> anyhow::Result<()> {
    let system = JobSystem::connect(config)
        .await
        .context("failed to connect to the job store")?;
    let gateway = system.gateway();

    match command {
        Command::Run => anyhow::bail!("run starts workers and is not a client command"),
        Command::Reset => print_json(&system.admin().reset().await?)?,
        Command::Submit {
            kind,
            params,
            identity,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("params must be JSON")?;
            let submission = gateway
                .submit(&identity, &JobKind::new(kind), &params)
                .await?;
            print_json(&submission)?;
        }
        Command::Status { job_id } => {
            print_json(&gateway.status(parse_job_id(&job_id)?).await?)?;
        }
        Command::Result { job_id, output } => {
            let bytes = gateway.result(parse_job_id(&job_id)?).await?;
            match output {
                Some(path) => std::fs::write(&path, &bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        Command::Cancel { job_id } => {
            print_json(&gateway.cancel(parse_job_id(&job_id)?).await?)?;
        }
        Command::Kinds => {
            for (kind, queue) in gateway.kinds() {
                println!("{kind}\t{queue}");
            }
        }
    }

    Ok(())
}
