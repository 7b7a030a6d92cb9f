//! GridCI command-line interface.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "gridci")]
#[command(about = "GridCI continuous-integration engine", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a tracing filter
    #[arg(long, env = "GRIDCI_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a repository, expand its test matrix and create a job-set bundle
    Prepare {
        /// Repository URL or local path
        repo: String,
        /// Commit to check out (defaults to the clone's HEAD)
        commit: Option<String>,
        /// Queue directory to create the bundle in
        #[arg(long, env = "GRIDCI_QUEUE", default_value = "queue")]
        queue_dir: PathBuf,
        /// Manifest file overriding the repository's ci.kdl
        #[arg(long)]
        config: Option<PathBuf>,
        /// Cap the number of generated jobs
        #[arg(long)]
        limit: Option<usize>,
        /// Write the created job-set id to this file
        #[arg(long)]
        id_file: Option<PathBuf>,
    },
    /// Run one job inside the sandbox
    Run {
        /// Job directory inside a bundle, e.g. queue/<id>.jobset/1.job
        job_dir: PathBuf,
        /// Re-run the job even if it already has a verdict
        #[arg(long)]
        rerun: bool,
        /// Extra bind mount HOST:CONTAINER[:ro]; may be repeated
        #[arg(long = "bind-mount")]
        bind_mounts: Vec<String>,
        /// Sandbox container image
        #[arg(long, env = "GRIDCI_IMAGE", default_value = gridci_executor::DEFAULT_IMAGE)]
        image: String,
        /// Maximum total runtime in seconds
        #[arg(long, default_value = "1800")]
        hard_timeout: u64,
        /// Maximum seconds without log output
        #[arg(long, default_value = "600")]
        idle_timeout: u64,
    },
    /// Finalize a job-set bundle and dispatch the notification
    Finalize {
        /// Bundle directory
        bundle: PathBuf,
    },
    /// Watch a queue directory and process job-set bundles
    Daemon {
        /// Queue directory to watch
        queue_dir: PathBuf,
        /// Seconds between queue rescans
        #[arg(long, default_value = "5")]
        scan_interval: u64,
        /// Sandbox container image
        #[arg(long, env = "GRIDCI_IMAGE", default_value = gridci_executor::DEFAULT_IMAGE)]
        image: String,
        /// Maximum total runtime per job in seconds
        #[arg(long, default_value = "1800")]
        hard_timeout: u64,
        /// Maximum seconds without log output per job
        #[arg(long, default_value = "600")]
        idle_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Prepare {
            repo,
            commit,
            queue_dir,
            config,
            limit,
            id_file,
        } => {
            commands::prepare::prepare(
                &repo,
                commit.as_deref(),
                &queue_dir,
                config.as_deref(),
                limit,
                id_file.as_deref(),
            )
            .await?;
        }
        Commands::Run {
            job_dir,
            rerun,
            bind_mounts,
            image,
            hard_timeout,
            idle_timeout,
        } => {
            let passed = commands::run::run(
                &job_dir,
                rerun,
                &bind_mounts,
                &image,
                hard_timeout,
                idle_timeout,
            )
            .await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Finalize { bundle } => {
            commands::finalize::finalize(&bundle).await?;
        }
        Commands::Daemon {
            queue_dir,
            scan_interval,
            image,
            hard_timeout,
            idle_timeout,
        } => {
            commands::daemon::daemon(&queue_dir, scan_interval, &image, hard_timeout, idle_timeout)
                .await?;
        }
    }

    Ok(())
}

/// Install the tracing subscriber. Level strings are validated here,
/// once; the engine itself never parses them. `RUST_LOG` wins over the
/// flag when set.
fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().context("invalid RUST_LOG filter")?
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level: {log_level}"))?
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
