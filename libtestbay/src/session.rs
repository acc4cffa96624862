//! On-disk job state, so a restarted controller can pick up where it left
//! off. Layout below the session directory:
//!
//! ```text
//! <cookie>/job.json
//! <cookie>/artifacts/<step>/<name>
//! <cookie>/.partial/          files being written
//! ```
//!
//! Persistence is best effort: callers log failures instead of failing the
//! transition that triggered them.

use std::path::{Path, PathBuf};

use nanoid::nanoid;
use tokio::fs;

use crate::error::{LabError, Result};
use crate::job::{validate_artifact_name, Artifacts, JobRecord};
use crate::log::*;

const RECORD_FILE: &str = "job.json";
const ARTIFACTS_DIR: &str = "artifacts";
const PARTIAL_DIR: &str = ".partial";

/// A job as found on disk.
#[derive(Debug)]
pub struct StoredJob {
    pub record: JobRecord,
    pub artifacts: Artifacts,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything belonging to the job `cookie`.
    pub fn job_dir(&self, cookie: &str) -> PathBuf {
        self.root.join(cookie)
    }

    #[tracing::instrument(skip(self, record), fields(cookie = %record.cookie()))]
    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let dir = self.job_dir(record.cookie());
        fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(record)?;
        write_atomically(&dir.join(PARTIAL_DIR), &dir.join(RECORD_FILE), &json).await
    }

    #[tracing::instrument(skip(self, data))]
    pub async fn save_artifact(&self, cookie: &str, step: usize, name: &str, data: &[u8]) -> Result<()> {
        validate_artifact_name(name)?;
        let job_dir = self.job_dir(cookie);
        let dir = job_dir.join(ARTIFACTS_DIR).join(step.to_string());
        fs::create_dir_all(&dir).await?;
        write_atomically(&job_dir.join(PARTIAL_DIR), &dir.join(name), data).await
    }

    /// Load every job below the session directory. Unreadable jobs are
    /// logged and skipped.
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn load_all(&self) -> Result<Vec<StoredJob>> {
        let mut jobs = vec![];
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("session: no session directory yet");
                return Ok(jobs);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.load(&entry.path()).await {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(
                    "session: skipping unreadable job in {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
        jobs.sort_by(|a, b| a.record.created_at().cmp(b.record.created_at()));
        info!("session: found {} jobs", jobs.len());
        Ok(jobs)
    }

    async fn load(&self, dir: &Path) -> Result<StoredJob> {
        let json = fs::read(dir.join(RECORD_FILE)).await?;
        let record: JobRecord = serde_json::from_slice(&json)?;
        if dir.file_name().and_then(|n| n.to_str()) != Some(record.cookie().as_str()) {
            return Err(LabError::InvalidRequest(format!(
                "record for {} stored in the wrong directory",
                record.cookie()
            )));
        }
        let artifacts = load_artifacts(&dir.join(ARTIFACTS_DIR)).await?;
        Ok(StoredJob { record, artifacts })
    }
}

async fn load_artifacts(dir: &Path) -> Result<Artifacts> {
    let mut artifacts = Artifacts::new();
    let mut steps = match fs::read_dir(dir).await {
        Ok(steps) => steps,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(artifacts),
        Err(e) => return Err(e.into()),
    };
    while let Some(step_dir) = steps.next_entry().await? {
        let Some(step) = step_dir
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<usize>().ok())
        else {
            continue;
        };
        let mut files = fs::read_dir(step_dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            if !file.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = file.file_name().to_str().map(String::from) else {
                continue;
            };
            let data = fs::read(file.path()).await?;
            artifacts.entry(step).or_default().insert(name, data);
        }
    }
    Ok(artifacts)
}

/// Write through a file in `partial_dir` so readers never see half a
/// record. `partial_dir` must be on the same filesystem as `path`.
async fn write_atomically(partial_dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    fs::create_dir_all(partial_dir).await?;
    let tmp = partial_dir.join(nanoid!());
    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
