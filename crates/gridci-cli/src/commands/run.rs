use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;

use gridci_core::{BindMount, JobState};
use gridci_engine::{run_job, RunOptions};
use gridci_executor::DockerSandbox;
use gridci_store::{JobSetDir, LeaseManager};

/// Run a single job. Returns whether it passed; the caller maps that to
/// the process exit status.
pub async fn run(
    job_dir: &Path,
    rerun: bool,
    bind_mounts: &[String],
    image: &str,
    hard_timeout: u64,
    idle_timeout: u64,
) -> Result<bool> {
    let (bundle, number) = locate_job(job_dir)?;
    let job_dir = bundle.job_dir(number)?;

    let options = RunOptions {
        rerun,
        hard_timeout: Duration::from_secs(hard_timeout),
        idle_timeout: Duration::from_secs(idle_timeout),
        bind_mounts: bind_mounts
            .iter()
            .map(|raw| parse_bind_mount(raw))
            .collect::<Result<_>>()?,
    };

    let sandbox = DockerSandbox::new(image)?;
    let leases = LeaseManager::for_current_process();
    let state = run_job(&sandbox, &leases, &bundle, &job_dir, &options).await?;
    println!("job {} finished: {:?}", number, state);
    Ok(state == JobState::Passed)
}

/// A job path is `<bundle>/<n>.job`; resolve both halves.
fn locate_job(path: &Path) -> Result<(JobSetDir, u32)> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} is not a job directory", path.display()))?;
    let number: u32 = name
        .strip_suffix(".job")
        .with_context(|| format!("{} is not a job directory (expected <n>.job)", name))?
        .parse()
        .with_context(|| format!("{} has no job number", name))?;
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent bundle", path.display()))?;
    Ok((JobSetDir::open(parent)?, number))
}

fn parse_bind_mount(raw: &str) -> Result<BindMount> {
    let mut parts = raw.splitn(3, ':');
    let host = parts.next().unwrap_or_default();
    let container = parts.next().unwrap_or_default();
    if host.is_empty() || container.is_empty() {
        bail!("invalid bind mount {:?}, expected HOST:CONTAINER[:ro]", raw);
    }
    let read_only = match parts.next() {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => bail!("invalid bind mount mode {:?} in {:?}", other, raw),
    };
    Ok(BindMount {
        host_path: host.to_string(),
        container_path: container.to_string(),
        read_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_mount_defaults_to_read_write() {
        let mount = parse_bind_mount("/var/cache:/cache").unwrap();
        assert_eq!(mount.host_path, "/var/cache");
        assert_eq!(mount.container_path, "/cache");
        assert!(!mount.read_only);
    }

    #[test]
    fn bind_mount_accepts_explicit_modes() {
        assert!(parse_bind_mount("/a:/b:ro").unwrap().read_only);
        assert!(!parse_bind_mount("/a:/b:rw").unwrap().read_only);
    }

    #[test]
    fn bind_mount_rejects_garbage() {
        assert!(parse_bind_mount("/only-host").is_err());
        assert!(parse_bind_mount("/a:/b:rx").is_err());
        assert!(parse_bind_mount(":/b").is_err());
    }

    #[test]
    fn locate_job_parses_bundle_and_number() {
        let dir = tempfile::TempDir::new().unwrap();
        let bundle_path = dir.path().join("x.jobset");
        std::fs::create_dir(&bundle_path).unwrap();

        let (_, number) = locate_job(&bundle_path.join("3.job")).unwrap();
        assert_eq!(number, 3);

        assert!(locate_job(&bundle_path.join("notajob")).is_err());
        assert!(locate_job(&bundle_path.join("x.job")).is_err());
    }
}
