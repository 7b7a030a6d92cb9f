//! Shared fixtures for engine tests.

use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use gridci_core::{
    Build, BuildState, Error, Job, JobState, Project, ResourceId, Result, Sandbox,
    SandboxOutcome, ScriptConfig, SandboxSpec, FORMAT_VERSION,
};
use gridci_store::JobSetDir;

use crate::notify::Notifier;

pub fn create_bundle(queue: &Path, job_count: u32) -> JobSetDir {
    let build = Build {
        id: ResourceId::new(),
        number: 1,
        format_version: FORMAT_VERSION.to_string(),
        revision: "0123456789abcdef".into(),
        before_revision: None,
        branch: Some("main".into()),
        author_name: "a".into(),
        author_email: "a@example.com".into(),
        committer_name: "a".into(),
        committer_email: "a@example.com".into(),
        subject: "test commit".into(),
        scripts: ScriptConfig {
            script: vec!["true".into()],
            ..ScriptConfig::default()
        },
        state: BuildState::Unprocessed,
        created_at: Utc::now(),
        finalized_at: None,
    };
    let project = Project {
        owner: "acme".into(),
        name: "widgets".into(),
        url: "https://example.com/acme/widgets.git".parse().unwrap(),
        deploy_key: None,
        webhook_secret: None,
    };
    let jobs: Vec<Job> = (1..=job_count)
        .map(|n| {
            let mut env = std::collections::BTreeMap::new();
            env.insert("GRIDCI_RUNTIME".to_string(), n.to_string());
            Job::new(n, env)
        })
        .collect();

    let snapshot = queue.join("snapshot-src.tar.gz");
    fs::write(&snapshot, b"not a real tarball").unwrap();
    JobSetDir::create(
        queue,
        &build,
        &jobs,
        &project,
        &snapshot,
        "deadbeefdeadbeef",
        None,
    )
    .unwrap()
}

pub fn set_job_states(bundle: &JobSetDir, states: &[JobState]) {
    for (job_dir, state) in bundle.job_dirs().unwrap().iter().zip(states) {
        let mut job = job_dir.load().unwrap();
        job.state = *state;
        job_dir.save(&mut job).unwrap();
    }
}

/// Sandbox that reports a scripted outcome without touching Docker.
pub struct FakeSandbox {
    exit_code: Option<i32>,
}

impl FakeSandbox {
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
        }
    }

    pub fn erroring() -> Self {
        Self { exit_code: None }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(&self, spec: SandboxSpec) -> Result<SandboxOutcome> {
        match self.exit_code {
            Some(exit_code) => {
                let started_at = Utc::now();
                fs::write(&spec.log_path, format!("fake run of job {}\n", spec.job.number))?;
                Ok(SandboxOutcome {
                    exit_code,
                    timed_out: None,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            None => Err(Error::ExecutionFailed("scripted infrastructure failure".into())),
        }
    }
}

/// Notifier that records how often, and with what verdict, it fired.
#[derive(Default)]
pub struct CountingNotifier {
    count: AtomicUsize,
    last: Mutex<Option<BuildState>>,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_state(&self) -> Option<BuildState> {
        *self.last.lock().unwrap()
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn build_finished(&self, _project: &Project, build: &Build) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(build.state);
        Ok(())
    }
}
