//! Runs one leased job through a sandbox to a terminal state.

use std::time::Duration;
use tracing::{error, info};

use gridci_core::{BindMount, JobState, Result, Sandbox, SandboxSpec};
use gridci_store::{JobDir, JobSetDir, LeaseManager, RunResult};

/// Knobs for a single job run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Take over a job that already reached a terminal state.
    pub rerun: bool,
    pub hard_timeout: Duration,
    pub idle_timeout: Duration,
    /// Extra mounts handed through to the sandbox.
    pub bind_mounts: Vec<BindMount>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rerun: false,
            hard_timeout: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            bind_mounts: Vec::new(),
        }
    }
}

/// Lease a job, run it in the sandbox, and release it with the verdict.
///
/// Lease acquisition failures propagate as errors so callers can tell
/// "someone else has it" apart from a run that happened. A sandbox
/// infrastructure failure releases the job as errored and returns that
/// state; the test script's own failure is a plain failed verdict.
pub async fn run_job(
    sandbox: &dyn Sandbox,
    leases: &LeaseManager,
    bundle: &JobSetDir,
    job_dir: &JobDir,
    options: &RunOptions,
) -> Result<JobState> {
    // Gather everything before taking the lease, so a broken bundle
    // never leaves a job stuck in processing.
    let build = bundle.load_supported_build()?;
    let project = bundle.load_project()?;
    let snapshot = bundle.snapshot_path()?;
    let credential = bundle.credential_path();

    let job = leases.acquire(bundle, job_dir, options.rerun)?;
    let number = job.number;
    info!(job = number, name = %job.name, "job started");

    let spec = SandboxSpec {
        job: job.clone(),
        build,
        project,
        snapshot,
        credential,
        bind_mounts: options.bind_mounts.clone(),
        hard_timeout: options.hard_timeout,
        idle_timeout: options.idle_timeout,
        log_path: job_dir.log_path(),
    };

    match sandbox.run(spec).await {
        Ok(outcome) => {
            let state = outcome.job_state();
            let result = RunResult {
                status: outcome.exit_code,
                passed: outcome.passed(),
                start_time: outcome.started_at,
                end_time: outcome.finished_at,
                duration_secs: outcome.duration().num_seconds(),
            };
            if let Err(err) = job_dir.save_result(&result) {
                error!(job = number, error = %err, "could not persist job result");
                leases.release(bundle, job_dir, job, JobState::Errored)?;
                return Err(err);
            }
            leases.release(bundle, job_dir, job, state)?;
            info!(job = number, state = ?state, "job finished");
            Ok(state)
        }
        Err(err) => {
            error!(job = number, error = %err, "sandbox failed, marking job errored");
            leases.release(bundle, job_dir, job, JobState::Errored)?;
            Ok(JobState::Errored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{create_bundle, FakeSandbox};
    use gridci_core::Error;
    use tempfile::TempDir;

    #[tokio::test]
    async fn passing_run_releases_passed_and_writes_result() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        let job_dir = bundle.job_dir(1).unwrap();
        let sandbox = FakeSandbox::exiting(0);
        let leases = LeaseManager::for_current_process();

        let state = run_job(&sandbox, &leases, &bundle, &job_dir, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(state, JobState::Passed);

        let stored = job_dir.load().unwrap();
        assert_eq!(stored.state, JobState::Passed);
        assert!(!job_dir.is_leased());

        let result = job_dir.load_result().unwrap();
        assert_eq!(result.status, 0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn nonzero_exit_releases_failed() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        let job_dir = bundle.job_dir(1).unwrap();
        let sandbox = FakeSandbox::exiting(3);
        let leases = LeaseManager::for_current_process();

        let state = run_job(&sandbox, &leases, &bundle, &job_dir, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(state, JobState::Failed);
        assert!(!job_dir.load_result().unwrap().passed);
    }

    #[tokio::test]
    async fn infrastructure_failure_releases_errored() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        let job_dir = bundle.job_dir(1).unwrap();
        let sandbox = FakeSandbox::erroring();
        let leases = LeaseManager::for_current_process();

        let state = run_job(&sandbox, &leases, &bundle, &job_dir, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(state, JobState::Errored);
        assert_eq!(job_dir.load().unwrap().state, JobState::Errored);
        assert!(!job_dir.is_leased());
        // No result artifact for a run the infrastructure aborted.
        assert!(job_dir.load_result().is_err());
    }

    #[tokio::test]
    async fn terminal_job_needs_rerun() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        let job_dir = bundle.job_dir(1).unwrap();
        let sandbox = FakeSandbox::exiting(0);
        let leases = LeaseManager::for_current_process();

        run_job(&sandbox, &leases, &bundle, &job_dir, &RunOptions::default())
            .await
            .unwrap();

        let again = run_job(&sandbox, &leases, &bundle, &job_dir, &RunOptions::default()).await;
        assert!(matches!(again, Err(Error::AlreadyProcessed(_))));

        let rerun = RunOptions {
            rerun: true,
            ..RunOptions::default()
        };
        let state = run_job(&sandbox, &leases, &bundle, &job_dir, &rerun)
            .await
            .unwrap();
        assert_eq!(state, JobState::Passed);
    }
}
