//! Crash-safe job leasing.
//!
//! A lease is the combination of the `processing` marker file and the
//! worker pid recorded in the job record. The marker gives exclusive
//! create semantics, the pid gives crash detection: a marker whose
//! recorded worker is no longer alive is a stale lease and can be
//! reclaimed. Every check-and-set sequence runs under the bundle lock
//! so that acquisition and liveness probing never interleave.

use chrono::Utc;
use tracing::{debug, warn};

use gridci_core::{BuildState, Error, Job, JobState, Result};

use crate::bundle::{JobDir, JobSetDir};
use crate::lock::is_pid_alive;

/// Acquires and releases job leases on behalf of one worker process.
#[derive(Debug, Clone, Copy)]
pub struct LeaseManager {
    worker_pid: u32,
}

impl LeaseManager {
    pub fn new(worker_pid: u32) -> Self {
        Self { worker_pid }
    }

    /// A manager leasing on behalf of the current process.
    pub fn for_current_process() -> Self {
        Self::new(std::process::id())
    }

    /// Try to lease a job. On success the job is `Processing`, the
    /// marker exists, and the returned record carries the version to
    /// release against.
    ///
    /// A stale lease (marker present, recorded worker dead) is reclaimed
    /// in place: the job is marked `Errored` first, and only a `rerun`
    /// acquisition then takes it over. Terminal jobs are likewise only
    /// leased again with `rerun`.
    pub fn acquire(&self, bundle: &JobSetDir, job_dir: &JobDir, rerun: bool) -> Result<Job> {
        let _guard = bundle.lock()?;

        let mut job = job_dir.load()?;

        if job.state == JobState::Processing {
            match job.worker_pid {
                Some(pid) if is_pid_alive(pid) => {
                    return Err(Error::AlreadyProcessing(format!(
                        "job {} is held by live worker {}",
                        job.number, pid
                    )));
                }
                _ => {
                    self.reclaim_stale(job_dir, &mut job)?;
                }
            }
        }

        if job.state.is_terminal() && !rerun {
            return Err(Error::AlreadyProcessed(format!(
                "job {} already reached {:?}",
                job.number, job.state
            )));
        }

        job_dir.create_marker()?;

        job.state = JobState::Processing;
        job.worker_pid = Some(self.worker_pid);
        job.start_time = Some(Utc::now());
        job.end_time = None;
        if let Err(err) = job_dir.save(&mut job) {
            // Roll the marker back so the job is not wedged.
            job_dir.remove_marker()?;
            return Err(err);
        }

        self.mark_build_processing(bundle)?;

        debug!(job = job.number, pid = self.worker_pid, "lease acquired");
        Ok(job)
    }

    /// Release a held lease, recording the terminal `state`.
    ///
    /// Idempotent with respect to reclaim races: if the stored record
    /// moved on since acquisition (a probe reclaimed the lease), the
    /// terminal state is not applied a second time. The marker is
    /// removed either way.
    pub fn release(&self, bundle: &JobSetDir, job_dir: &JobDir, mut job: Job, state: JobState) -> Result<()> {
        let _guard = bundle.lock()?;

        job.state = state;
        job.worker_pid = None;
        job.end_time = Some(Utc::now());
        match job_dir.save(&mut job) {
            Ok(()) => {}
            Err(err) if err.is_contention() => {
                warn!(
                    job = job.number,
                    "lease was reclaimed while running, keeping the stored verdict"
                );
            }
            Err(err) => return Err(err),
        }

        job_dir.remove_marker()?;
        debug!(job = job.number, state = ?state, "lease released");
        Ok(())
    }

    /// Probe a `Processing` job for a dead worker. Returns the reclaimed
    /// record if the lease was stale, `None` if the job is fine.
    pub fn check_really_processing(
        &self,
        bundle: &JobSetDir,
        job_dir: &JobDir,
    ) -> Result<Option<Job>> {
        let _guard = bundle.lock()?;

        let mut job = job_dir.load()?;
        if job.state != JobState::Processing {
            return Ok(None);
        }
        if let Some(pid) = job.worker_pid {
            if is_pid_alive(pid) {
                return Ok(None);
            }
        }

        self.reclaim_stale(job_dir, &mut job)?;
        Ok(Some(job))
    }

    /// Caller holds the bundle lock and has seen `state == Processing`
    /// with a dead (or missing) worker pid.
    fn reclaim_stale(&self, job_dir: &JobDir, job: &mut Job) -> Result<()> {
        warn!(
            job = job.number,
            pid = job.worker_pid,
            "worker died mid-job, marking errored"
        );
        job.state = JobState::Errored;
        job.worker_pid = None;
        job.end_time = Some(Utc::now());
        job_dir.save(job)?;
        job_dir.remove_marker()
    }

    /// First lease in a bundle moves the build out of `Unprocessed`.
    fn mark_build_processing(&self, bundle: &JobSetDir) -> Result<()> {
        let mut build = bundle.load_build()?;
        if build.state == BuildState::Unprocessed {
            build.state = BuildState::Processing;
            bundle.save_build(&build)?;
        }
        Ok(())
    }
}
