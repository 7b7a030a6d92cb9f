use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::process::Command;
use tracing::info;
use url::Url;

use gridci_core::{Build, BuildState, Job, Project, ResourceId, FORMAT_VERSION};
use gridci_store::{next_build_number, JobSetDir};

/// Clone the repository, expand its matrix and commit a bundle to the
/// queue. The build record is written last, so a crash mid-prepare never
/// leaves an eligible half-bundle behind.
pub async fn prepare(
    repo: &str,
    commit: Option<&str>,
    queue_dir: &Path,
    config: Option<&Path>,
    limit: Option<usize>,
    id_file: Option<&Path>,
) -> Result<()> {
    std::fs::create_dir_all(queue_dir)?;

    let checkout = tempfile::TempDir::new()?;
    info!(repo, "cloning repository");
    let mut clone = Command::new("git");
    clone
        .arg("clone")
        .arg("--quiet")
        .arg(repo)
        .arg(checkout.path());
    run_command(clone, "git clone").await?;

    if let Some(commit) = commit {
        let mut co = Command::new("git");
        co.arg("-C")
            .arg(checkout.path())
            .args(["checkout", "--quiet", commit]);
        run_command(co, "git checkout").await?;
    }

    let metadata = commit_metadata(checkout.path()).await?;

    let manifest_text = match config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read manifest {}", path.display()))?,
        None => std::fs::read_to_string(checkout.path().join("ci.kdl"))
            .context("repository has no ci.kdl; pass --config")?,
    };
    let manifest = gridci_config::parse_manifest(&manifest_text)?;

    let jobs = matrix_jobs(&manifest, limit)?;

    info!(revision = %metadata.revision, jobs = jobs.len(), "creating job set");
    let snapshot = snapshot_tarball(checkout.path()).await?;
    let digest = sha256_digest(snapshot.path())?;

    let build = Build {
        id: ResourceId::new(),
        number: next_build_number(queue_dir)?,
        format_version: FORMAT_VERSION.to_string(),
        revision: metadata.revision,
        before_revision: None,
        branch: metadata.branch,
        author_name: metadata.author_name,
        author_email: metadata.author_email,
        committer_name: metadata.committer_name,
        committer_email: metadata.committer_email,
        subject: metadata.subject,
        scripts: manifest.scripts,
        state: BuildState::Unprocessed,
        created_at: Utc::now(),
        finalized_at: None,
    };
    let project = project_from_repo(repo)?;

    let job_count = jobs.len();
    let bundle = JobSetDir::create(
        queue_dir,
        &build,
        &jobs,
        &project,
        snapshot.path(),
        &digest,
        None,
    )?;

    if let Some(id_file) = id_file {
        std::fs::write(id_file, format!("{}\n", build.id))?;
    }

    println!(
        "created job set {} ({} jobs) at {}",
        build.id,
        job_count,
        bundle.path().display()
    );
    Ok(())
}

/// Turn the expanded matrix into numbered jobs, refusing to queue a
/// build with no jobs at all.
fn matrix_jobs(
    manifest: &gridci_config::BuildManifest,
    limit: Option<usize>,
) -> Result<Vec<Job>> {
    let mut environments = gridci_config::expand(&manifest.matrix);
    if let Some(limit) = limit {
        environments.truncate(limit);
    }
    if environments.is_empty() {
        bail!("job set would contain no jobs; raise --limit");
    }
    Ok(environments
        .into_iter()
        .enumerate()
        .map(|(index, environment)| Job::new(index as u32 + 1, environment))
        .collect())
}

struct CommitMetadata {
    revision: String,
    author_name: String,
    author_email: String,
    committer_name: String,
    committer_email: String,
    subject: String,
    branch: Option<String>,
}

async fn commit_metadata(checkout: &Path) -> Result<CommitMetadata> {
    // Unit-separator delimited so subjects with any printable text parse.
    let mut show = Command::new("git");
    show.arg("-C").arg(checkout).args([
        "show",
        "-s",
        "--pretty=format:%H%x1f%an%x1f%ae%x1f%cn%x1f%ce%x1f%s",
    ]);
    let raw = run_command(show, "git show").await?;
    let fields: Vec<&str> = raw.trim_end().split('\u{1f}').collect();
    if fields.len() != 6 {
        bail!("unexpected git show output: {:?}", raw);
    }

    let mut branch_cmd = Command::new("git");
    branch_cmd
        .arg("-C")
        .arg(checkout)
        .args(["rev-parse", "--abbrev-ref", "HEAD"]);
    let branch_raw = run_command(branch_cmd, "git rev-parse").await?;
    let branch = branch_raw.trim();
    // Detached HEAD reports the literal string "HEAD".
    let branch = (branch != "HEAD").then(|| branch.to_string());

    Ok(CommitMetadata {
        revision: fields[0].to_string(),
        author_name: fields[1].to_string(),
        author_email: fields[2].to_string(),
        committer_name: fields[3].to_string(),
        committer_email: fields[4].to_string(),
        subject: fields[5].to_string(),
        branch,
    })
}

async fn snapshot_tarball(checkout: &Path) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::NamedTempFile::new()?;
    let mut tar = Command::new("tar");
    tar.arg("-czf")
        .arg(file.path())
        .arg("--exclude=.git")
        .arg("-C")
        .arg(checkout)
        .arg(".");
    run_command(tar, "tar").await?;
    Ok(file)
}

fn sha256_digest(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn project_from_repo(repo: &str) -> Result<Project> {
    let url = match Url::parse(repo) {
        Ok(url) => url,
        Err(_) => {
            let absolute = std::fs::canonicalize(repo)
                .with_context(|| format!("repository {} does not exist", repo))?;
            Url::from_file_path(&absolute)
                .map_err(|_| anyhow!("cannot express {} as a URL", absolute.display()))?
        }
    };

    let mut segments: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let name = segments.pop().unwrap_or_else(|| "repository".to_string());
    let name = name.strip_suffix(".git").unwrap_or(&name).to_string();
    let owner = segments
        .pop()
        .or_else(|| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "local".to_string());

    Ok(Project {
        owner,
        name,
        url,
        deploy_key: None,
        webhook_secret: None,
    })
}

async fn run_command(mut command: Command, what: &str) -> Result<String> {
    let output = command
        .output()
        .await
        .with_context(|| format!("running {}", what))?;
    if !output.status.success() {
        bail!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest() -> gridci_config::BuildManifest {
        gridci_config::parse_manifest(
            r#"
            matrix {
                runtime "docker" "podman"
            }
            script "true"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn limit_truncates_the_job_list() {
        let jobs = matrix_jobs(&manifest(), Some(1)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].number, 1);
    }

    #[test]
    fn zero_limit_is_rejected_before_anything_is_queued() {
        let err = matrix_jobs(&manifest(), Some(0)).unwrap_err();
        assert!(err.to_string().contains("no jobs"));
    }

    #[test]
    fn project_from_https_url() {
        let project = project_from_repo("https://example.com/acme/widgets.git").unwrap();
        assert_eq!(project.owner, "acme");
        assert_eq!(project.name, "widgets");
        assert_eq!(project.long_name(), "acme/widgets");
    }

    #[test]
    fn project_from_local_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = dir.path().join("widgets");
        std::fs::create_dir(&repo).unwrap();

        let project = project_from_repo(repo.to_str().unwrap()).unwrap();
        assert_eq!(project.name, "widgets");
        assert_eq!(project.url.scheme(), "file");
    }

    #[test]
    fn project_from_missing_path_fails() {
        assert!(project_from_repo("/definitely/not/a/repo").is_err());
    }

    #[test]
    fn sha256_digest_is_stable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let digest = sha256_digest(file.path()).unwrap();
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
