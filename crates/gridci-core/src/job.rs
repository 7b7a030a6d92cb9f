//! Job records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ResourceId;

/// State of a single job.
///
/// `Unprocessed → Processing → {Passed, Failed, Errored}`. Terminal states
/// are monotonic: the only way out is an explicit rerun, which resets the
/// job to `Unprocessed` through lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unprocessed,
    Processing,
    Passed,
    Failed,
    Errored,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Passed | JobState::Failed | JobState::Errored)
    }
}

/// One (environment, script) execution unit within a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: ResourceId,
    /// Position in the sorted matrix expansion, 1-based. Stable.
    pub number: u32,
    /// Human-readable name derived from the environment.
    pub name: String,
    /// Environment variables for the sandbox, in deterministic key order.
    pub environment: BTreeMap<String, String>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Pid of the worker currently processing this job. Recorded while
    /// `state == Processing`, cleared on release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    /// Optimistic-concurrency token, bumped on every persisted mutation.
    pub lock_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a fresh unprocessed job for one point in the matrix.
    pub fn new(number: u32, environment: BTreeMap<String, String>) -> Self {
        let name = display_name(&environment);
        Self {
            id: ResourceId::new(),
            number,
            name,
            environment,
            state: JobState::Unprocessed,
            worker_pid: None,
            lock_version: 0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Human-readable display name for an environment: `k=v; k=v` pairs in
/// key order.
pub fn display_name(environment: &BTreeMap<String, String>) -> String {
    environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn new_job_starts_unprocessed() {
        let job = Job::new(1, env(&[("GRIDCI_RUNTIME", "1.0")]));
        assert_eq!(job.state, JobState::Unprocessed);
        assert_eq!(job.lock_version, 0);
        assert!(job.worker_pid.is_none());
        assert!(!job.is_processed());
    }

    #[test]
    fn display_name_joins_pairs_in_key_order() {
        let job = Job::new(1, env(&[("B", "2"), ("A", "1")]));
        assert_eq!(job.name, "A=1; B=2");
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Unprocessed.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Passed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Errored.is_terminal());
    }
}
