//! Queue-watching daemon.
//!
//! Scans a queue directory for job-set bundles, drives every eligible
//! bundle through the runner and the finalizer, deletes finalized
//! bundles, and waits for the next rescan. Shutdown is cooperative: the
//! first signal stops the daemon after the current batch, the third
//! terminates the process immediately. In-flight jobs are never killed
//! by a graceful shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use gridci_core::{Error, JobState, Result, Sandbox};
use gridci_store::{list_job_sets, JobSetDir, LeaseManager};

use crate::finalize::{finalize_and_notify, Finalize};
use crate::notify::Notifier;
use crate::runner::{run_job, RunOptions};

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// How long to wait between queue rescans when nothing woke us.
    pub scan_interval: Duration,
    pub run: RunOptions,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            run: RunOptions::default(),
        }
    }
}

pub struct Daemon {
    queue_dir: PathBuf,
    sandbox: Arc<dyn Sandbox>,
    notifier: Arc<dyn Notifier>,
    leases: LeaseManager,
    options: DaemonOptions,
}

impl Daemon {
    pub fn new(
        queue_dir: impl Into<PathBuf>,
        sandbox: Arc<dyn Sandbox>,
        notifier: Arc<dyn Notifier>,
        options: DaemonOptions,
    ) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            sandbox,
            notifier,
            leases: LeaseManager::for_current_process(),
            options,
        }
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let signals = SignalState::watch()?;
        info!(queue = %self.queue_dir.display(), "daemon started");

        loop {
            if let Err(err) = self.process_queue().await {
                error!(error = %err, "queue scan failed");
            }
            if signals.stop_requested() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.scan_interval) => {}
                _ = signals.woken() => {}
            }
            if signals.stop_requested() {
                break;
            }
        }

        info!("daemon stopped");
        Ok(())
    }

    /// One full scan: process every eligible bundle to exhaustion.
    async fn process_queue(&self) -> Result<()> {
        for bundle in list_job_sets(&self.queue_dir)? {
            if !bundle.is_complete() {
                debug!(bundle = %bundle.path().display(), "bundle still being written, skipping");
                continue;
            }
            if let Err(err) = self.process_bundle(&bundle).await {
                if err.is_contention() {
                    debug!(bundle = %bundle.path().display(), error = %err, "bundle busy");
                } else {
                    error!(bundle = %bundle.path().display(), error = %err, "bundle processing failed");
                }
            }
        }
        Ok(())
    }

    async fn process_bundle(&self, bundle: &JobSetDir) -> Result<()> {
        let build = match bundle.load_supported_build() {
            Ok(build) => build,
            Err(Error::UnsupportedFormat(version)) => {
                warn!(
                    bundle = %bundle.path().display(),
                    version = %version,
                    "unsupported bundle format, skipping"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // Reclaim leases whose workers died before deciding eligibility.
        for job_dir in bundle.job_dirs()? {
            self.leases.check_really_processing(bundle, &job_dir)?;
        }
        if bundle.is_processing()? {
            debug!(build = build.number, "another worker is on this job set");
            return Ok(());
        }

        for job_dir in bundle.job_dirs()? {
            if job_dir.load()?.state != JobState::Unprocessed {
                continue;
            }
            match run_job(
                self.sandbox.as_ref(),
                &self.leases,
                bundle,
                &job_dir,
                &self.options.run,
            )
            .await
            {
                Ok(state) => debug!(job = job_dir.number(), state = ?state, "job processed"),
                Err(err) if err.is_contention() => {
                    debug!(job = job_dir.number(), "job taken by another worker")
                }
                Err(err) => error!(job = job_dir.number(), error = %err, "job run failed"),
            }
        }

        if let Finalize::Performed(state) =
            finalize_and_notify(bundle, self.notifier.as_ref()).await?
        {
            info!(build = build.number, state = ?state, "build finalized");
        }

        // Finalized bundles are deleted even when another worker ran or
        // finalized them; the daemon is the queue's garbage collector.
        if bundle.load_build()?.finalized_at.is_some() {
            info!(bundle = %bundle.path().display(), "removing processed bundle");
            bundle.clone().delete()?;
        }
        Ok(())
    }
}

/// Signal bookkeeping shared between the watcher task and the main loop.
struct SignalState {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl SignalState {
    fn watch() -> Result<Self> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());

        let task_count = Arc::clone(&count);
        let task_notify = Arc::clone(&notify);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                let seen = task_count.fetch_add(1, Ordering::SeqCst) + 1;
                match seen {
                    1 => info!("shutdown requested, stopping after the current batch"),
                    2 => warn!("second signal received, still finishing the current batch"),
                    _ => {
                        warn!("third signal received, terminating immediately");
                        std::process::exit(1);
                    }
                }
                task_notify.notify_waiters();
            }
        });

        Ok(Self { count, notify })
    }

    fn stop_requested(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }

    async fn woken(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::testutil::{create_bundle, set_job_states, CountingNotifier, FakeSandbox};
    use gridci_core::BuildState;
    use std::fs;
    use tempfile::TempDir;

    fn daemon(queue: &TempDir, sandbox: FakeSandbox, notifier: Arc<dyn Notifier>) -> Daemon {
        Daemon::new(
            queue.path(),
            Arc::new(sandbox),
            notifier,
            DaemonOptions::default(),
        )
    }

    #[tokio::test]
    async fn scan_runs_finalizes_and_deletes_a_bundle() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 2);
        let path = bundle.path().to_path_buf();

        let notifier = Arc::new(CountingNotifier::default());
        let daemon = daemon(&queue, FakeSandbox::exiting(0), notifier.clone());
        daemon.process_queue().await.unwrap();

        assert!(!path.exists());
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn failing_jobs_still_finalize_the_bundle() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 2);

        let notifier = Arc::new(CountingNotifier::default());
        let daemon = daemon(&queue, FakeSandbox::exiting(1), notifier.clone());
        daemon.process_queue().await.unwrap();

        assert_eq!(notifier.last_state(), Some(BuildState::Failed));
        assert!(!bundle.path().exists());
    }

    #[tokio::test]
    async fn job_set_without_jobs_is_collected() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 0);
        let path = bundle.path().to_path_buf();

        let daemon = daemon(&queue, FakeSandbox::exiting(0), Arc::new(LogNotifier));
        daemon.process_queue().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn incomplete_bundles_are_left_alone() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        // Simulate a bundle still being written.
        fs::remove_file(bundle.path().join("info.json")).unwrap();

        let daemon = daemon(&queue, FakeSandbox::exiting(0), Arc::new(LogNotifier));
        daemon.process_queue().await.unwrap();

        assert!(bundle.path().exists());
        assert_eq!(bundle.job_dir(1).unwrap().load().unwrap().state, JobState::Unprocessed);
    }

    #[tokio::test]
    async fn unsupported_format_is_skipped_not_deleted() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        let mut build = bundle.load_build().unwrap();
        build.format_version = "9.9".to_string();
        bundle.save_build(&build).unwrap();

        let daemon = daemon(&queue, FakeSandbox::exiting(0), Arc::new(LogNotifier));
        daemon.process_queue().await.unwrap();

        assert!(bundle.path().exists());
    }

    #[tokio::test]
    async fn already_finalized_bundle_is_garbage_collected() {
        let queue = TempDir::new().unwrap();
        let bundle = create_bundle(queue.path(), 1);
        set_job_states(&bundle, &[JobState::Passed]);
        crate::finalize::try_finalize(&bundle).unwrap();

        let notifier = Arc::new(CountingNotifier::default());
        let daemon = daemon(&queue, FakeSandbox::exiting(0), notifier.clone());
        daemon.process_queue().await.unwrap();

        // Deleted, but no second notification.
        assert!(!bundle.path().exists());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn infra_errors_surface_in_the_verdict() {
        let queue = TempDir::new().unwrap();
        create_bundle(queue.path(), 2);

        let notifier = Arc::new(CountingNotifier::default());
        let daemon = daemon(&queue, FakeSandbox::erroring(), notifier.clone());
        daemon.process_queue().await.unwrap();

        assert_eq!(notifier.last_state(), Some(BuildState::Errored));
    }
}
