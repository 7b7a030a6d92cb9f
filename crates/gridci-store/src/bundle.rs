//! Job-set bundle directories.
//!
//! Bundle layout:
//!
//! ```text
//! <build-id>.jobset/
//!   info.json                  build record; its presence marks the
//!                              bundle as completely written
//!   project.json
//!   credential                 optional private blob
//!   snapshot-<digest>.tar.gz   content-addressed repository snapshot
//!   registry.lock              flock scope for check-and-set sequences
//!   1.job/
//!     job.json
//!     output.log               append-only log artifact
//!     processing               lease marker, present while leased
//!     result.json              present once terminal
//!   2.job/ ...
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use gridci_core::{Build, Error, Job, Project, Result, FORMAT_VERSION};

use crate::lock::{lock_exclusive, FileLockGuard};

pub const BUNDLE_SUFFIX: &str = ".jobset";
pub const JOB_DIR_SUFFIX: &str = ".job";
pub const INFO_FILE: &str = "info.json";
pub const PROJECT_FILE: &str = "project.json";
pub const JOB_FILE: &str = "job.json";
pub const RESULT_FILE: &str = "result.json";
pub const LOG_FILE: &str = "output.log";
pub const PROCESSING_MARKER: &str = "processing";
pub const REGISTRY_LOCK: &str = "registry.lock";
pub const CREDENTIAL_FILE: &str = "credential";

/// Per-job outcome written for external collaborators once the job is
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// The job's exit status (the timeout sentinel for timed-out runs).
    pub status: i32,
    pub passed: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: i64,
}

/// Handle to one job-set bundle directory.
#[derive(Debug, Clone)]
pub struct JobSetDir {
    path: PathBuf,
}

impl JobSetDir {
    /// Open an existing bundle directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(Error::NotFound(format!(
                "job-set directory {} does not exist",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    /// Create a new bundle under `queue_dir`.
    ///
    /// Everything is written before `info.json`: the build record is the
    /// commit signal, so a half-written bundle is never eligible for
    /// processing. A configuration failure earlier in the pipeline means
    /// this is never called, so no partial job-set can exist.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        queue_dir: &Path,
        build: &Build,
        jobs: &[Job],
        project: &Project,
        snapshot_src: &Path,
        snapshot_digest: &str,
        credential_src: Option<&Path>,
    ) -> Result<Self> {
        let path = queue_dir.join(format!("{}{}", build.id, BUNDLE_SUFFIX));
        fs::create_dir(&path)?;
        let bundle = Self { path };

        write_json_atomic(&bundle.path.join(PROJECT_FILE), project)?;

        let digest_prefix: String = snapshot_digest.chars().take(12).collect();
        let snapshot_dst = bundle
            .path
            .join(format!("snapshot-{}.tar.gz", digest_prefix));
        fs::copy(snapshot_src, &snapshot_dst)?;

        if let Some(credential) = credential_src {
            fs::copy(credential, bundle.path.join(CREDENTIAL_FILE))?;
        }

        for job in jobs {
            let job_dir = bundle.path.join(format!("{}{}", job.number, JOB_DIR_SUFFIX));
            fs::create_dir(&job_dir)?;
            write_json_atomic(&job_dir.join(JOB_FILE), job)?;
            // Exclusive create: a name collision here is a bug upstream,
            // not something to silently overwrite.
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(job_dir.join(LOG_FILE))?;
        }

        write_json_atomic(&bundle.path.join(INFO_FILE), build)?;
        Ok(bundle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A bundle is complete once its build record exists; before that it
    /// is still being written by `prepare`.
    pub fn is_complete(&self) -> bool {
        self.path.join(INFO_FILE).is_file()
    }

    pub fn load_build(&self) -> Result<Build> {
        read_json(&self.path.join(INFO_FILE))
    }

    /// Load the build record, rejecting unsupported bundle formats.
    pub fn load_supported_build(&self) -> Result<Build> {
        let build = self.load_build()?;
        if build.format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(build.format_version));
        }
        Ok(build)
    }

    pub fn save_build(&self, build: &Build) -> Result<()> {
        write_json_atomic(&self.path.join(INFO_FILE), build)
    }

    pub fn load_project(&self) -> Result<Project> {
        read_json(&self.path.join(PROJECT_FILE))
    }

    /// Job directories, ordered by job number.
    pub fn job_dirs(&self) -> Result<Vec<JobDir>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(JOB_DIR_SUFFIX) else {
                continue;
            };
            let Ok(number) = stem.parse::<u32>() else {
                continue;
            };
            if entry.file_type()?.is_dir() {
                dirs.push(JobDir {
                    path: entry.path(),
                    number,
                });
            }
        }
        dirs.sort_by_key(|dir| dir.number);
        Ok(dirs)
    }

    pub fn job_dir(&self, number: u32) -> Result<JobDir> {
        let path = self.path.join(format!("{}{}", number, JOB_DIR_SUFFIX));
        if !path.is_dir() {
            return Err(Error::NotFound(format!(
                "job {} in {}",
                number,
                self.path.display()
            )));
        }
        Ok(JobDir { path, number })
    }

    /// The content-addressed repository snapshot shared by all jobs.
    pub fn snapshot_path(&self) -> Result<PathBuf> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("snapshot-") && name.ends_with(".tar.gz") {
                return Ok(entry.path());
            }
        }
        Err(Error::NotFound(format!(
            "repository snapshot in {}",
            self.path.display()
        )))
    }

    pub fn credential_path(&self) -> Option<PathBuf> {
        let path = self.path.join(CREDENTIAL_FILE);
        path.is_file().then_some(path)
    }

    /// Whether any job in the bundle is currently leased.
    pub fn is_processing(&self) -> Result<bool> {
        Ok(self.job_dirs()?.iter().any(|job| job.is_leased()))
    }

    /// Whether every job in the bundle has reached a terminal state.
    pub fn is_processed(&self) -> Result<bool> {
        for job_dir in self.job_dirs()? {
            if !job_dir.load()?.is_processed() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Take the bundle-scoped exclusive lock. Held only for single
    /// check-and-set sequences, never across a sandbox run.
    pub fn lock(&self) -> Result<FileLockGuard> {
        Ok(lock_exclusive(&self.path.join(REGISTRY_LOCK))?)
    }

    /// Delete the bundle and everything in it.
    pub fn delete(self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

/// List all bundles in a queue directory, in directory order.
pub fn list_job_sets(queue_dir: &Path) -> Result<Vec<JobSetDir>> {
    let mut bundles = Vec::new();
    for entry in fs::read_dir(queue_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(BUNDLE_SUFFIX) && entry.file_type()?.is_dir() {
            bundles.push(JobSetDir { path: entry.path() });
        }
    }
    bundles.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(bundles)
}

const SEQUENCE_FILE: &str = ".sequence";
const SEQUENCE_LOCK: &str = ".sequence.lock";

/// Allocate the next build number for a queue.
///
/// Backed by a counter file under the queue directory, so numbers keep
/// climbing after finalized bundles are deleted. Concurrent producers
/// serialize on a queue-level flock.
pub fn next_build_number(queue_dir: &Path) -> Result<u64> {
    let _guard = lock_exclusive(&queue_dir.join(SEQUENCE_LOCK))?;
    let path = queue_dir.join(SEQUENCE_FILE);
    let current = match fs::read_to_string(&path) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
            Error::Internal(format!("corrupt sequence file {}: {:?}", path.display(), raw))
        })?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };
    let next = current + 1;
    fs::write(&path, next.to_string())?;
    Ok(next)
}

/// Handle to one job directory inside a bundle.
#[derive(Debug, Clone)]
pub struct JobDir {
    path: PathBuf,
    number: u32,
}

impl JobDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn load(&self) -> Result<Job> {
        read_json(&self.path.join(JOB_FILE))
    }

    /// Persist a job record with optimistic concurrency: the write only
    /// happens if the stored `lock_version` still matches the one the
    /// caller loaded. On success the record's version is bumped.
    pub fn save(&self, job: &mut Job) -> Result<()> {
        let current: Job = self.load()?;
        if current.lock_version != job.lock_version {
            return Err(Error::Conflict(format!(
                "job {} was modified concurrently (version {} != {})",
                self.number, current.lock_version, job.lock_version
            )));
        }
        job.lock_version += 1;
        write_json_atomic(&self.path.join(JOB_FILE), job)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.path.join(RESULT_FILE)
    }

    pub fn save_result(&self, result: &RunResult) -> Result<()> {
        write_json_atomic(&self.result_path(), result)
    }

    pub fn load_result(&self) -> Result<RunResult> {
        read_json(&self.result_path())
    }

    /// Whether the lease marker is present.
    pub fn is_leased(&self) -> bool {
        self.path.join(PROCESSING_MARKER).exists()
    }

    /// Atomically create the lease marker. Fails if it already exists.
    pub(crate) fn create_marker(&self) -> Result<()> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path.join(PROCESSING_MARKER))
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(
                Error::AlreadyProcessing(format!("job {} lease marker exists", self.number)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the lease marker. Idempotent: a missing marker is fine.
    pub(crate) fn remove_marker(&self) -> Result<()> {
        match fs::remove_file(self.path.join(PROCESSING_MARKER)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => err.into(),
    })?;
    Ok(serde_json::from_reader(io::BufReader::new(file))?)
}

/// Write a JSON document via a temp file and rename, so readers never
/// observe a half-written record.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::Internal(format!("path {} has no parent directory", path.display()))
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.persist(path)
        .map_err(|err| Error::Io(err.error))?;
    Ok(())
}
