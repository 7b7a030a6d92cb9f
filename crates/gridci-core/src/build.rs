//! Build (job-set) records and the aggregate verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobState;
use crate::ResourceId;

/// Bundle format version this engine reads and writes.
pub const FORMAT_VERSION: &str = "1.0";

/// State of a build (job-set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Unprocessed,
    Processing,
    Passed,
    Failed,
    Errored,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Passed | BuildState::Failed | BuildState::Errored
        )
    }

    /// The aggregate verdict over a set of terminal job states.
    ///
    /// All passed is passed, all failed is failed, and any other mix is
    /// errored: a single errored job taints the whole build, and a
    /// passed/failed mix means the build as a whole cannot be trusted
    /// either. There is no majority vote.
    pub fn aggregate(jobs: &[JobState]) -> BuildState {
        if jobs.iter().all(|state| *state == JobState::Passed) {
            BuildState::Passed
        } else if jobs.iter().all(|state| *state == JobState::Failed) {
            BuildState::Failed
        } else {
            BuildState::Errored
        }
    }
}

/// Resolved script stages for a build, in execution order.
///
/// Each stage is a list of shell commands. Empty stages are skipped by the
/// in-container runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub before_install: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub before_script: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub after_success: Vec<String>,
    #[serde(default)]
    pub after_failure: Vec<String>,
    #[serde(default)]
    pub after_script: Vec<String>,
}

/// One invocation of the build matrix against one commit.
///
/// Owns its jobs (stored alongside it in the bundle, ordered by number).
/// Destroyed only together with the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Unique identifier.
    pub id: ResourceId,
    /// Sequential number, scoped to the project.
    pub number: u64,
    /// Bundle format version. Presence of the build record marks the
    /// bundle as completely written.
    pub format_version: String,
    /// Commit being tested.
    pub revision: String,
    /// Start of the changeset, for reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
    /// Commit subject line.
    pub subject: String,
    /// Resolved script configuration shared by all jobs.
    pub scripts: ScriptConfig,
    pub state: BuildState,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the build reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_processed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn short_revision(&self) -> &str {
        let end = self.revision.len().min(7);
        &self.revision[..end]
    }
}
