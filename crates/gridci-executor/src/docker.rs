//! Docker sandbox implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gridci_core::{
    Error, Result, ResourceId, Sandbox, SandboxOutcome, SandboxSpec, TimeoutKind,
    TIMEOUT_EXIT_CODE,
};

use crate::lines::LineBuffer;

/// Default image for the in-container runner. The image's entrypoint
/// reads the descriptors under `/input`, blocks on `/output/continue`,
/// then runs the script stages.
pub const DEFAULT_IMAGE: &str = "gridci/sandbox:latest";

const LINE_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for trailing log chunks after the container stops.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Sandbox backed by the local Docker daemon.
pub struct DockerSandbox {
    docker: Docker,
    image: String,
    /// Override for the image entrypoint. Used by tests to drive plain
    /// images through the container protocol.
    command: Option<Vec<String>>,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon.
    pub fn new(image: impl Into<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker, image))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
            command: None,
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("gridci-job-{}", job_id)
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        container_name: &str,
        staging: &Staging,
    ) -> Result<(i32, Option<TimeoutKind>)> {
        let env: Vec<String> = spec
            .job
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(self.image.clone()),
            cmd: self.command.clone(),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(staging.binds(spec)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.to_string(),
            platform: None,
        };

        info!(container = %container_name, image = %self.image, "creating sandbox container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to create container: {}", e)))?;

        self.docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to start container: {}", e)))?;

        // Attach the follower before releasing the runner, so the marker
        // guarantees no output is produced before capture is in place.
        let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        let mut log_stream = self.docker.logs(
            container_name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let follower = tokio::spawn(async move {
            let mut buffer = LineBuffer::new();
            while let Some(result) = log_stream.next().await {
                match result {
                    Ok(output) => {
                        for line in buffer.push(&output.into_bytes()) {
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "log stream error");
                        break;
                    }
                }
            }
            if let Some(tail) = buffer.finish() {
                let _ = tx.send(tail).await;
            }
        });

        let mut wait_stream = self.docker.wait_container(
            container_name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        staging.write_continue_marker()?;

        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .await?;

        let hard_deadline = Instant::now() + spec.hard_timeout;
        let mut idle_deadline = Instant::now() + spec.idle_timeout;
        let mut lines_open = true;

        let result: Result<(i32, Option<TimeoutKind>)> = loop {
            let deadline = hard_deadline.min(idle_deadline);
            tokio::select! {
                line = rx.recv(), if lines_open => match line {
                    Some(line) => {
                        log_file.write_all(line.as_bytes()).await?;
                        log_file.write_all(b"\n").await?;
                        debug!(job = spec.job.number, "{}", line);
                        idle_deadline = Instant::now() + spec.idle_timeout;
                    }
                    None => lines_open = false,
                },
                waited = wait_stream.next() => {
                    break match waited {
                        Some(Ok(body)) => Ok((body.status_code as i32, None)),
                        Some(Err(bollard::errors::Error::DockerContainerWaitError {
                            code, ..
                        })) => Ok((code as i32, None)),
                        Some(Err(e)) => Err(Error::ExecutionFailed(format!(
                            "failed waiting for container: {}",
                            e
                        ))),
                        None => Err(Error::ExecutionFailed(
                            "container wait stream ended without a status".to_string(),
                        )),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let kind = if deadline == hard_deadline {
                        TimeoutKind::Hard
                    } else {
                        TimeoutKind::Idle
                    };
                    warn!(job = spec.job.number, kind = ?kind, "job timed out, killing container");
                    self.kill_container(container_name).await;
                    let note = match kind {
                        TimeoutKind::Hard => format!(
                            "job killed: exceeded total time budget of {}s",
                            spec.hard_timeout.as_secs()
                        ),
                        TimeoutKind::Idle => format!(
                            "job killed: produced no output for more than {}s",
                            spec.idle_timeout.as_secs()
                        ),
                    };
                    log_file.write_all(note.as_bytes()).await?;
                    log_file.write_all(b"\n").await?;
                    break Ok((TIMEOUT_EXIT_CODE, Some(kind)));
                }
            }
        };

        if result.is_ok() {
            // Chunks buffered behind the winning select arm, or still in
            // flight from the daemon, belong to the artifact. The follow
            // stream ends on its own once the container stops, so drain
            // until the follower hangs up.
            Self::drain_lines(&mut rx, &mut log_file, DRAIN_GRACE).await?;
        }
        follower.abort();

        result
    }

    /// Write everything left in the line channel to the log file,
    /// waiting up to `grace` for the follower to deliver its tail and
    /// hang up.
    async fn drain_lines(
        rx: &mut mpsc::Receiver<String>,
        log_file: &mut tokio::fs::File,
        grace: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + grace;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        log_file.write_all(line.as_bytes()).await?;
                        log_file.write_all(b"\n").await?;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        log_file.flush().await?;
        Ok(())
    }

    async fn kill_container(&self, container_name: &str) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = self.docker.kill_container(container_name, Some(options)).await {
            debug!(error = %e, container = %container_name, "kill failed");
        }
    }

    async fn remove_container(&self, container_name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            debug!(error = %e, container = %container_name, "container removal failed");
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: SandboxSpec) -> Result<SandboxOutcome> {
        let container_name = Self::container_name(&spec.job.id);
        let staging = Staging::materialize(&spec)?;
        let started_at = Utc::now();

        let result = self.execute(&spec, &container_name, &staging).await;
        self.remove_container(&container_name).await;

        match result {
            Ok((exit_code, timed_out)) => Ok(SandboxOutcome {
                exit_code,
                timed_out,
                started_at,
                finished_at: Utc::now(),
            }),
            Err(err) => {
                append_abort_note(&spec.log_path);
                Err(err)
            }
        }
    }
}

fn append_abort_note(log_path: &Path) {
    let appended = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut file| writeln!(file, "administrative abort: sandbox infrastructure failure"));
    if let Err(e) = appended {
        warn!(error = %e, "could not append abort note to log artifact");
    }
}

/// Host-side staging directories backing the container's `/input` and
/// `/output` mounts. Dropped (and deleted) after the run.
struct Staging {
    input: tempfile::TempDir,
    output: tempfile::TempDir,
}

impl Staging {
    fn materialize(spec: &SandboxSpec) -> Result<Self> {
        let input = tempfile::TempDir::new()?;
        let output = tempfile::TempDir::new()?;

        write_json(&input.path().join("job.json"), &spec.job)?;
        write_json(&input.path().join("build.json"), &spec.build)?;
        write_json(&input.path().join("project.json"), &spec.project)?;
        if let Some(credential) = &spec.credential {
            fs::copy(credential, input.path().join("credential"))?;
        }

        Ok(Self { input, output })
    }

    fn binds(&self, spec: &SandboxSpec) -> Vec<String> {
        let mut binds = vec![
            format!("{}:/input:ro", self.input.path().display()),
            format!("{}:/output:rw", self.output.path().display()),
            format!("{}:/input/repo.tar.gz:ro", spec.snapshot.display()),
        ];
        for mount in &spec.bind_mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            binds.push(format!(
                "{}:{}:{}",
                mount.host_path, mount.container_path, mode
            ));
        }
        binds
    }

    /// Unblock the in-container runner. Written only once the log
    /// follower is attached, so no output can be lost.
    fn write_continue_marker(&self) -> Result<()> {
        File::create(self.output.path().join("continue"))?;
        Ok(())
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
