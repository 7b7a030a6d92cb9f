//! Exactly-once job-set finalization.

use chrono::Utc;
use tracing::info;

use gridci_core::{BuildState, Result};
use gridci_store::JobSetDir;

use crate::notify::Notifier;

/// Outcome of a finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// This call performed the terminal transition.
    Performed(BuildState),
    /// Nothing to do: jobs still pending, or someone else already
    /// finalized the build.
    Noop,
}

/// Aggregate a fully-terminal job-set into its build verdict, exactly
/// once. Runs under the bundle lock; concurrent completions of the last
/// two jobs collapse to a single `Performed`.
pub fn try_finalize(bundle: &JobSetDir) -> Result<Finalize> {
    let _guard = bundle.lock()?;

    let mut build = bundle.load_build()?;
    if build.finalized_at.is_some() {
        return Ok(Finalize::Noop);
    }

    let mut states = Vec::new();
    for job_dir in bundle.job_dirs()? {
        let job = job_dir.load()?;
        if !job.is_processed() {
            return Ok(Finalize::Noop);
        }
        states.push(job.state);
    }

    // Vacuously all-passed for a job-set with no jobs; producers reject
    // those, but one in the queue must still become collectable.
    let verdict = BuildState::aggregate(&states);
    info!(build = build.number, state = ?verdict, "finalizing job set");
    build.state = verdict;
    build.finalized_at = Some(Utc::now());
    bundle.save_build(&build)?;
    Ok(Finalize::Performed(verdict))
}

/// Finalize and, if this call performed the transition, dispatch the
/// notification. Dispatch happens after the lock is released.
pub async fn finalize_and_notify(bundle: &JobSetDir, notifier: &dyn Notifier) -> Result<Finalize> {
    let outcome = try_finalize(bundle)?;
    if let Finalize::Performed(_) = outcome {
        let build = bundle.load_build()?;
        let project = bundle.load_project()?;
        notifier.build_finished(&project, &build).await?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{create_bundle, set_job_states, CountingNotifier};
    use gridci_core::JobState;
    use tempfile::TempDir;

    #[test]
    fn pending_jobs_mean_noop() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 2);
        assert_eq!(try_finalize(&bundle).unwrap(), Finalize::Noop);
        assert!(bundle.load_build().unwrap().finalized_at.is_none());
    }

    #[test]
    fn all_passed_finalizes_as_passed() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 2);
        set_job_states(&bundle, &[JobState::Passed, JobState::Passed]);

        assert_eq!(
            try_finalize(&bundle).unwrap(),
            Finalize::Performed(BuildState::Passed)
        );
        let build = bundle.load_build().unwrap();
        assert_eq!(build.state, BuildState::Passed);
        assert!(build.finalized_at.is_some());
    }

    #[test]
    fn job_set_without_jobs_finalizes_vacuously() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 0);

        assert_eq!(
            try_finalize(&bundle).unwrap(),
            Finalize::Performed(BuildState::Passed)
        );
        assert!(bundle.load_build().unwrap().finalized_at.is_some());
    }

    #[test]
    fn mixed_outcomes_finalize_as_errored() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 2);
        set_job_states(&bundle, &[JobState::Passed, JobState::Failed]);

        assert_eq!(
            try_finalize(&bundle).unwrap(),
            Finalize::Performed(BuildState::Errored)
        );
    }

    #[test]
    fn second_finalize_is_a_noop() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        set_job_states(&bundle, &[JobState::Failed]);

        assert_eq!(
            try_finalize(&bundle).unwrap(),
            Finalize::Performed(BuildState::Failed)
        );
        assert_eq!(try_finalize(&bundle).unwrap(), Finalize::Noop);
    }

    #[tokio::test]
    async fn exactly_one_notification_is_dispatched() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        set_job_states(&bundle, &[JobState::Passed]);

        let notifier = CountingNotifier::default();
        finalize_and_notify(&bundle, &notifier).await.unwrap();
        finalize_and_notify(&bundle, &notifier).await.unwrap();
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn no_notification_while_jobs_pending() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);

        let notifier = CountingNotifier::default();
        finalize_and_notify(&bundle, &notifier).await.unwrap();
        assert_eq!(notifier.count(), 0);
    }
}
