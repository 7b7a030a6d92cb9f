//! Filesystem entity store and lease manager for GridCI.
//!
//! A job-set lives in a bundle directory under a queue. The bundle holds
//! the build record, the project record, the repository snapshot and one
//! directory per job. All engine coordination happens through these files
//! plus the lease manager: there is no shared memory between workers.

pub mod bundle;
pub mod lease;
pub mod lock;

pub use bundle::{list_job_sets, next_build_number, JobDir, JobSetDir, RunResult};
pub use lease::LeaseManager;
pub use lock::{is_pid_alive, lock_exclusive, try_lock_exclusive, FileLockGuard};
