//! Orchestration engine for GridCI.
//!
//! Ties the store, the lease manager and a sandbox together: running a
//! single job to a terminal state, finalizing a job-set exactly once,
//! and the daemon that drives a whole queue directory.

pub mod daemon;
pub mod finalize;
pub mod notify;
pub mod runner;

#[cfg(test)]
mod testutil;

pub use daemon::{Daemon, DaemonOptions};
pub use finalize::{finalize_and_notify, try_finalize, Finalize};
pub use notify::{LogNotifier, Notifier};
pub use runner::{run_job, RunOptions};
