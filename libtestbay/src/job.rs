//! A [`Job`] runs one test suite with one profile on one host. Its steps are
//! the flattened test cases of the suite; the remote host walks through them
//! and reports each outcome back by cookie and step index.
//!
//! ```text
//! CREATED --start--> RUNNING --last step finished/skipped--> COMPLETED
//!    |                  |
//!    +------abort-------+----------------------------------> ABORTED
//! ```
//!
//! Every transition validates first and mutates afterwards, so a rejected
//! call leaves the job untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use derive_getters::Getters;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{LabError, Result};
use crate::host::Host;
use crate::log::*;
use crate::profile::Profile;
use crate::testsuite::Testsuite;

/// What a caller asks to run.
#[derive(Getters, Clone)]
pub struct JobSpec {
    testsuite: Arc<Testsuite>,
    profile: Arc<dyn Profile>,
    host: Arc<dyn Host>,
    additional_kargs: String,
}

impl JobSpec {
    pub fn new(
        testsuite: Arc<Testsuite>,
        profile: Arc<dyn Profile>,
        host: Arc<dyn Host>,
        additional_kargs: String,
    ) -> Self {
        Self {
            testsuite,
            profile,
            host,
            additional_kargs,
        }
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("testsuite", self.testsuite.name())
            .field("profile", &self.profile.name())
            .field("host", &self.host.name())
            .field("additional_kargs", &self.additional_kargs)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Aborted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Skipped,
    Success,
    Failure,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Skipped | StepStatus::Success | StepStatus::Failure
        )
    }
}

#[derive(Getters, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    index: usize,
    testcase: String,
    status: StepStatus,
    #[serde(default)]
    detail: Option<String>,
}

/// Where an artifact lives.
#[derive(Getters, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    step: usize,
    name: String,
    size: usize,
}

impl ArtifactRef {
    pub(crate) fn new(step: usize, name: &str, size: usize) -> Self {
        Self {
            step,
            name: name.to_string(),
            size,
        }
    }
}

/// Artifact payloads per step, then per name.
pub type Artifacts = BTreeMap<usize, BTreeMap<String, Vec<u8>>>;

/// A point-in-time view of a job; this is what callers get back and what is
/// persisted in the session directory.
#[derive(Getters, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    cookie: String,
    testsuite: String,
    profile: String,
    host: String,
    additional_kargs: String,
    status: JobStatus,
    current_step: usize,
    steps: Vec<Step>,
    #[serde(default)]
    annotations: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    /// `Some(true)` once a job completed without failed steps.
    #[serde(default)]
    passed: Option<bool>,
}

pub struct Job {
    cookie: String,
    testsuite_name: String,
    testsuite: Option<Arc<Testsuite>>,
    profile: Arc<dyn Profile>,
    host: Arc<dyn Host>,
    additional_kargs: String,
    status: JobStatus,
    steps: Vec<Step>,
    current_step: usize,
    artifacts: Artifacts,
    annotations: String,
    created_at: OffsetDateTime,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("cookie", &self.cookie)
            .field("status", &self.status)
            .field("current_step", &self.current_step)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl Job {
    /// A new job in [`JobStatus::Created`]. `host` is the host instance
    /// bound to this job (see [`Host::for_job`]).
    pub fn new<S: Into<String>>(cookie: S, spec: JobSpec, host: Arc<dyn Host>) -> Self {
        let steps = spec
            .testsuite
            .testcases()
            .enumerate()
            .map(|(index, case)| Step {
                index,
                testcase: case.name().clone(),
                status: StepStatus::Pending,
                detail: None,
            })
            .collect();
        Self {
            cookie: cookie.into(),
            testsuite_name: spec.testsuite.name().clone(),
            testsuite: Some(spec.testsuite),
            profile: spec.profile,
            host,
            additional_kargs: spec.additional_kargs,
            status: JobStatus::Created,
            steps,
            current_step: 0,
            artifacts: Artifacts::new(),
            annotations: String::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Rebuild a job from its persisted record. `testsuite` is `None` when
    /// the suite is gone from the inventory.
    pub fn restore(
        record: JobRecord,
        testsuite: Option<Arc<Testsuite>>,
        profile: Arc<dyn Profile>,
        host: Arc<dyn Host>,
        artifacts: Artifacts,
    ) -> Result<Self> {
        if record.current_step > record.steps.len() {
            return Err(LabError::InvalidRequest(format!(
                "job {}: current step {} out of range",
                record.cookie, record.current_step
            )));
        }
        Ok(Self {
            cookie: record.cookie,
            testsuite_name: record.testsuite,
            testsuite,
            profile,
            host,
            additional_kargs: record.additional_kargs,
            status: record.status,
            steps: record.steps,
            current_step: record.current_step,
            artifacts,
            annotations: record.annotations,
            created_at: record.created_at,
        })
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn testsuite(&self) -> Option<&Arc<Testsuite>> {
        self.testsuite.as_ref()
    }

    pub fn testsuite_name(&self) -> &str {
        &self.testsuite_name
    }

    pub fn profile(&self) -> &Arc<dyn Profile> {
        &self.profile
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn additional_kargs(&self) -> &str {
        &self.additional_kargs
    }

    pub fn annotations(&self) -> &str {
        &self.annotations
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    /// `None` until the job completed; then whether no step failed. Skipped
    /// steps don't count as failures.
    pub fn passed(&self) -> Option<bool> {
        (self.status == JobStatus::Completed).then(|| {
            self.steps
                .iter()
                .all(|step| step.status != StepStatus::Failure)
        })
    }

    pub fn record(&self) -> JobRecord {
        JobRecord {
            cookie: self.cookie.clone(),
            testsuite: self.testsuite_name.clone(),
            profile: self.profile.name().to_string(),
            host: self.host.name().to_string(),
            additional_kargs: self.additional_kargs.clone(),
            status: self.status,
            current_step: self.current_step,
            steps: self.steps.clone(),
            annotations: self.annotations.clone(),
            created_at: self.created_at,
            passed: self.passed(),
        }
    }

    fn ensure_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LabError::AlreadyTerminal {
                cookie: self.cookie.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    /// Checks shared by step callbacks: `n` must be the running step.
    fn ensure_running_step(&self, n: usize) -> Result<()> {
        self.ensure_not_terminal()?;
        if n != self.current_step {
            return Err(LabError::StepMismatch {
                cookie: self.cookie.clone(),
                expected: self.current_step,
                got: n,
            });
        }
        match self.steps.get(n) {
            Some(step) if step.status == StepStatus::Running => Ok(()),
            Some(step) => Err(LabError::InvalidRequest(format!(
                "job {}: step {} is {:?}, not running",
                self.cookie, n, step.status
            ))),
            None => Err(LabError::InvalidRequest(format!(
                "job {}: no step {}",
                self.cookie, n
            ))),
        }
    }

    /// Whether [`Job::start`] would be accepted.
    pub fn ensure_startable(&self) -> Result<()> {
        self.ensure_not_terminal()
    }

    /// Start the job. Returns `false` if it was already running.
    #[tracing::instrument(skip(self), fields(cookie = %self.cookie))]
    pub fn start(&mut self) -> Result<bool> {
        self.ensure_not_terminal()?;
        if self.status == JobStatus::Running {
            debug!("job: already running");
            return Ok(false);
        }
        self.status = JobStatus::Running;
        self.current_step = 0;
        self.enter_current_step();
        info!("job: started with {} steps", self.steps.len());
        Ok(true)
    }

    /// Record the verdict for step `n`. Returns `true` if this completed the
    /// job.
    #[tracing::instrument(skip(self, detail), fields(cookie = %self.cookie))]
    pub fn finish_step(&mut self, n: usize, success: bool, detail: Option<String>) -> Result<bool> {
        self.ensure_running_step(n)?;
        let step = &mut self.steps[n];
        step.status = if success {
            StepStatus::Success
        } else {
            StepStatus::Failure
        };
        step.detail = detail;
        info!("job: step {} ({}) finished: {:?}", n, step.testcase, step.status);
        Ok(self.advance())
    }

    /// Skip step `n`. Returns `true` if this completed the job.
    #[tracing::instrument(skip(self), fields(cookie = %self.cookie))]
    pub fn skip_step(&mut self, n: usize) -> Result<bool> {
        self.ensure_running_step(n)?;
        self.steps[n].status = StepStatus::Skipped;
        info!("job: step {} skipped", n);
        Ok(self.advance())
    }

    /// Abort the job from any non-terminal state. A running step fails.
    #[tracing::instrument(skip(self), fields(cookie = %self.cookie))]
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_not_terminal()?;
        if let Some(step) = self.steps.get_mut(self.current_step) {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Failure;
                step.detail = Some("aborted".into());
            }
        }
        self.status = JobStatus::Aborted;
        info!("job: aborted at step {}", self.current_step);
        Ok(())
    }

    fn advance(&mut self) -> bool {
        self.current_step += 1;
        self.enter_current_step()
    }

    /// Mark the step at `current_step` running, or complete the job if there
    /// is none left.
    fn enter_current_step(&mut self) -> bool {
        match self.steps.get_mut(self.current_step) {
            Some(step) => {
                step.status = StepStatus::Running;
                false
            }
            None => {
                self.status = JobStatus::Completed;
                info!("job: {} completed, passed: {:?}", self.cookie, self.passed());
                true
            }
        }
    }

    pub fn step(&self, n: usize) -> Result<&Step> {
        self.steps.get(n).ok_or_else(|| {
            LabError::InvalidRequest(format!("job {}: no step {}", self.cookie, n))
        })
    }

    pub fn annotate(&mut self, text: &[u8]) {
        self.annotations.push_str(&String::from_utf8_lossy(text));
    }

    /// Store an artifact for the running step. Returns the step index.
    #[tracing::instrument(skip(self, data), fields(cookie = %self.cookie))]
    pub fn add_artifact_to_current_step(&mut self, name: &str, data: Vec<u8>) -> Result<usize> {
        validate_artifact_name(name)?;
        self.ensure_not_terminal()?;
        let step = self
            .steps
            .get(self.current_step)
            .filter(|step| step.status == StepStatus::Running)
            .ok_or_else(|| {
                LabError::InvalidRequest(format!("job {}: no step is running", self.cookie))
            })?
            .index;
        debug!("job: artifact {} ({} bytes) for step {}", name, data.len(), step);
        self.artifacts
            .entry(step)
            .or_default()
            .insert(name.to_string(), data);
        Ok(step)
    }

    /// The first artifact called `name`, searching steps in order. Two steps
    /// storing the same name can't be told apart here.
    pub fn get_artifact(&self, name: &str) -> Result<&[u8]> {
        self.artifacts
            .values()
            .find_map(|artifacts| artifacts.get(name))
            .map(Vec::as_slice)
            .ok_or_else(|| LabError::not_found("artifact", name))
    }

    pub fn list_artifacts(&self) -> Vec<ArtifactRef> {
        self.artifacts
            .iter()
            .flat_map(|(step, artifacts)| {
                artifacts.iter().map(move |(name, data)| ArtifactRef {
                    step: *step,
                    name: name.clone(),
                    size: data.len(),
                })
            })
            .collect()
    }

    /// All artifacts as a gzipped tarball with `step-<n>/<name>` entries, or
    /// `None` if nothing was collected yet.
    pub fn artifacts_archive(&self) -> Result<Option<Vec<u8>>> {
        if self.artifacts.values().all(BTreeMap::is_empty) {
            return Ok(None);
        }
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (step, artifacts) in &self.artifacts {
            for (name, data) in artifacts {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(self.created_at.unix_timestamp().max(0) as u64);
                builder.append_data(&mut header, format!("step-{step}/{name}"), data.as_slice())?;
            }
        }
        Ok(Some(builder.into_inner()?.finish()?))
    }
}

/// Artifact names are plain file names.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(LabError::InvalidName(name.to_string()));
    }
    Ok(())
}
