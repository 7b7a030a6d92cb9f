//! Sandbox trait and execution types.
//!
//! A sandbox runs exactly one job's script inside an isolated container
//! and reports a terminal exit code. Implementations must never leave
//! orphaned containers or follower tasks behind, on any code path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::build::Build;
use crate::job::{Job, JobState};
use crate::project::Project;
use crate::Result;

/// Reserved job-result code reported when a sandbox run is killed for
/// exceeding a time budget. Internal to job results; never used as a
/// process exit status.
pub const TIMEOUT_EXIT_CODE: i32 = 127;

/// Which time budget a timed-out job exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Total runtime exceeded the hard deadline.
    Hard,
    /// No log output for longer than the idle window.
    Idle,
}

/// An extra bind mount handed through to the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything a sandbox needs to run one job.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// The job being run. Serialized into `/input/job.json`.
    pub job: Job,
    /// The owning build. Serialized into `/input/build.json`.
    pub build: Build,
    /// The owning project. Serialized into `/input/project.json`.
    pub project: Project,
    /// Content-addressed repository snapshot tarball, shared read-only
    /// across all jobs of the build.
    pub snapshot: PathBuf,
    /// Optional private credential blob, mounted read-only.
    pub credential: Option<PathBuf>,
    /// Extra bind mounts requested by the caller.
    pub bind_mounts: Vec<BindMount>,
    /// Maximum total runtime.
    pub hard_timeout: Duration,
    /// Maximum time with zero log output.
    pub idle_timeout: Duration,
    /// The job's append-only log artifact on the host.
    pub log_path: PathBuf,
}

/// Result of a completed sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    /// The container's exit code, or [`TIMEOUT_EXIT_CODE`] on timeout.
    pub exit_code: i32,
    /// Set when the run was killed for exceeding a budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<TimeoutKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SandboxOutcome {
    /// Map the outcome to a terminal job state. A timeout is a failure,
    /// not an error: the pipeline itself worked, the workload overran.
    pub fn job_state(&self) -> JobState {
        if self.exit_code == 0 {
            JobState::Passed
        } else {
            JobState::Failed
        }
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Trait for sandbox executors.
///
/// Infrastructure failures (container cannot be created, exit status
/// cannot be determined) surface as `Err`; the caller records the job as
/// errored. A job whose script fails is an `Ok` outcome with a non-zero
/// exit code.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Name of this sandbox backend.
    fn name(&self) -> &'static str;

    /// Run one job to completion, streaming its log to `spec.log_path`.
    async fn run(&self, spec: SandboxSpec) -> Result<SandboxOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(exit_code: i32, timed_out: Option<TimeoutKind>) -> SandboxOutcome {
        let now = Utc::now();
        SandboxOutcome {
            exit_code,
            timed_out,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn zero_exit_code_passes() {
        assert_eq!(outcome(0, None).job_state(), JobState::Passed);
    }

    #[test]
    fn nonzero_exit_code_fails() {
        assert_eq!(outcome(3, None).job_state(), JobState::Failed);
    }

    #[test]
    fn timeout_sentinel_is_a_failure_not_an_error() {
        let out = outcome(TIMEOUT_EXIT_CODE, Some(TimeoutKind::Idle));
        assert_eq!(out.job_state(), JobState::Failed);
    }
}
