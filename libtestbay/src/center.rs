//! The job registry. Every operation a remote host or a caller can perform on
//! a job goes through [`JobCenter`].
//!
//! Locking: the registry map is only held to look up or insert jobs; each job
//! has its own mutex, held while validating, mutating and persisting it.
//! Backend calls (PXE toggling, power control, teardown) and hooks always
//! happen with no lock held.

use std::collections::HashMap;
use std::sync::Arc;

use nanoid::nanoid;
use tokio::sync::{Mutex, RwLock};

use crate::bootstrap::BootstrapTemplate;
use crate::error::{LabError, Result};
use crate::hooks::{HookEvent, Hooks};
use crate::host::Host;
use crate::inventory::Inventory;
use crate::job::{ArtifactRef, Job, JobRecord, JobSpec, JobStatus, Step};
use crate::log::*;
use crate::planner::PlanWorker;
use crate::profile::Profile;
use crate::session::SessionStore;

pub const COOKIE_LENGTH: usize = 24;

const COOKIE_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

pub fn generate_cookie() -> String {
    nanoid!(COOKIE_LENGTH, &COOKIE_ALPHABET)
}

/// Caller supplied cookies end up in paths and URLs.
pub fn validate_cookie(cookie: &str) -> Result<()> {
    if cookie.is_empty()
        || cookie.len() > 64
        || !cookie
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(LabError::InvalidRequest(format!(
            "'{cookie}' is not a valid cookie"
        )));
    }
    Ok(())
}

type JobEntry = Arc<Mutex<Job>>;

#[derive(Debug)]
pub struct JobCenter {
    jobs: RwLock<HashMap<String, JobEntry>>,
    sessions: SessionStore,
    hooks: Hooks,
    bootstrap: BootstrapTemplate,
    pub(crate) plans: RwLock<HashMap<String, PlanWorker>>,
}

impl JobCenter {
    pub fn new(sessions: SessionStore) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            sessions,
            hooks: Hooks::disabled(),
            bootstrap: BootstrapTemplate::default(),
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapTemplate) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    async fn entry(&self, cookie: &str) -> Result<JobEntry> {
        self.jobs
            .read()
            .await
            .get(cookie)
            .cloned()
            .ok_or_else(|| LabError::not_found("job", cookie))
    }

    /// Persist `job`. Called with the job's lock held.
    async fn persist(&self, job: &Job) {
        if let Err(e) = self.sessions.save(&job.record()).await {
            error!("center: failed to persist job {}: {}", job.cookie(), e);
        }
    }

    async fn fire(&self, event: HookEvent, record: &JobRecord) {
        self.hooks.fire(event, record).await;
    }

    /// Register a new job in [`JobStatus::Created`]. A `requested_cookie`
    /// must be unused; otherwise a fresh one is generated.
    #[tracing::instrument(skip(self))]
    pub async fn submit(&self, spec: JobSpec, requested_cookie: Option<String>) -> Result<JobRecord> {
        if let Some(cookie) = &requested_cookie {
            validate_cookie(cookie)?;
        }

        let entry = {
            let mut jobs = self.jobs.write().await;
            let cookie = match requested_cookie {
                Some(cookie) if jobs.contains_key(&cookie) => {
                    return Err(LabError::CookieConflict(cookie));
                }
                Some(cookie) => cookie,
                None => loop {
                    let cookie = generate_cookie();
                    if !jobs.contains_key(&cookie) {
                        break cookie;
                    }
                },
            };
            let host = spec
                .host()
                .clone()
                .for_job(&cookie, &self.sessions.job_dir(&cookie));
            let entry = Arc::new(Mutex::new(Job::new(cookie.clone(), spec, host)));
            jobs.insert(cookie, entry.clone());
            entry
        };

        let record = {
            let job = entry.lock().await;
            self.persist(&job).await;
            job.record()
        };
        info!(
            "center: submitted job {} ({} with {} on {})",
            record.cookie(),
            record.testsuite(),
            record.profile(),
            record.host()
        );
        self.fire(HookEvent::Submitted, &record).await;
        Ok(record)
    }

    /// Prepare the host of a created job and boot it into the job's profile:
    /// images and domain for virtual hosts, profile assignment with the
    /// job's kernel arguments, PXE on next boot, then power.
    #[tracing::instrument(skip(self))]
    pub async fn provision_job(&self, cookie: &str) -> Result<()> {
        let (host, profile, additional_kargs) = {
            let job = self.entry(cookie).await?;
            let job = job.lock().await;
            job.ensure_startable()?;
            if job.status() != JobStatus::Created {
                return Err(LabError::InvalidRequest(format!(
                    "job {cookie} is {}, only created jobs can be provisioned",
                    job.status()
                )));
            }
            (
                job.host().clone(),
                job.profile().clone(),
                job.additional_kargs().to_string(),
            )
        };

        info!("center: provisioning {} for job {}", host.name(), cookie);
        if host.is_virtual() {
            host.create_images().await?;
            host.define().await?;
        }
        profile
            .assign_to(host.as_ref(), cookie, &additional_kargs)
            .await?;
        profile.enable_pxe(host.as_ref(), true).await?;
        if host.is_virtual() {
            host.boot().await?;
        } else {
            host.reboot().await?;
        }
        debug!("center: {} is booting for job {}", host.name(), cookie);
        Ok(())
    }

    /// Start a job. PXE is disabled first so the host boots from disk from
    /// now on; a failure there leaves the job untouched. Starting a running
    /// job only disables PXE again.
    #[tracing::instrument(skip(self))]
    pub async fn start_job(&self, cookie: &str) -> Result<JobRecord> {
        let entry = self.entry(cookie).await?;
        let (host, profile) = {
            let job = entry.lock().await;
            job.ensure_startable()?;
            (job.host().clone(), job.profile().clone())
        };

        profile.enable_pxe(host.as_ref(), false).await?;

        let (started, record) = {
            let mut job = entry.lock().await;
            let started = job.start()?;
            if started {
                self.persist(&job).await;
            }
            (started, job.record())
        };
        if started {
            self.fire(HookEvent::Started, &record).await;
            if record.status().is_terminal() {
                self.fire(HookEvent::Finished, &record).await;
            }
        }
        Ok(record)
    }

    #[tracing::instrument(skip(self, detail))]
    pub async fn finish_test_step(
        &self,
        cookie: &str,
        n: usize,
        success: bool,
        detail: Option<String>,
    ) -> Result<JobRecord> {
        let entry = self.entry(cookie).await?;
        let (completed, record) = {
            let mut job = entry.lock().await;
            let completed = job
                .finish_step(n, success, detail)
                .map_err(|e| log_stale(cookie, e))?;
            self.persist(&job).await;
            (completed, job.record())
        };
        if completed {
            self.fire(HookEvent::Finished, &record).await;
        }
        Ok(record)
    }

    #[tracing::instrument(skip(self))]
    pub async fn skip_step(&self, cookie: &str, n: usize) -> Result<JobRecord> {
        let entry = self.entry(cookie).await?;
        let (completed, record) = {
            let mut job = entry.lock().await;
            let completed = job.skip_step(n).map_err(|e| log_stale(cookie, e))?;
            self.persist(&job).await;
            (completed, job.record())
        };
        if completed {
            self.fire(HookEvent::Finished, &record).await;
        }
        Ok(record)
    }

    /// Abort a job and tear its host down. Teardown problems are logged but
    /// don't fail the abort.
    #[tracing::instrument(skip(self))]
    pub async fn abort_job(&self, cookie: &str) -> Result<JobRecord> {
        let entry = self.entry(cookie).await?;
        let (record, host, profile) = {
            let mut job = entry.lock().await;
            job.abort().map_err(|e| log_stale(cookie, e))?;
            self.persist(&job).await;
            (job.record(), job.host().clone(), job.profile().clone())
        };
        teardown(cookie, host.as_ref(), profile.as_ref()).await;
        self.fire(HookEvent::Aborted, &record).await;
        Ok(record)
    }

    #[tracing::instrument(skip(self, text))]
    pub async fn annotate(&self, cookie: &str, text: &[u8]) -> Result<()> {
        let entry = self.entry(cookie).await?;
        let mut job = entry.lock().await;
        job.annotate(text);
        self.persist(&job).await;
        Ok(())
    }

    /// Store an artifact for the running step. Returns where it went.
    #[tracing::instrument(skip(self, data))]
    pub async fn add_artifact(&self, cookie: &str, name: &str, data: Vec<u8>) -> Result<ArtifactRef> {
        let entry = self.entry(cookie).await?;
        let mut job = entry.lock().await;
        let size = data.len();
        let step = job.add_artifact_to_current_step(name, data)?;
        if let Some(data) = job.artifacts().get(&step).and_then(|a| a.get(name)) {
            if let Err(e) = self.sessions.save_artifact(cookie, step, name, data).await {
                error!("center: failed to persist artifact {} of {}: {}", name, cookie, e);
            }
        }
        Ok(ArtifactRef::new(step, name, size))
    }

    pub async fn get_artifact(&self, cookie: &str, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(cookie).await?;
        let job = entry.lock().await;
        job.get_artifact(name).map(<[u8]>::to_vec)
    }

    pub async fn list_artifacts(&self, cookie: &str) -> Result<Vec<ArtifactRef>> {
        let entry = self.entry(cookie).await?;
        let job = entry.lock().await;
        Ok(job.list_artifacts())
    }

    pub async fn artifacts_archive(&self, cookie: &str) -> Result<Option<Vec<u8>>> {
        let entry = self.entry(cookie).await?;
        let job = entry.lock().await;
        job.artifacts_archive()
    }

    pub async fn step_result(&self, cookie: &str, n: usize) -> Result<Step> {
        let entry = self.entry(cookie).await?;
        let job = entry.lock().await;
        job.step(n).cloned()
    }

    /// The archive of the suite the job runs.
    pub async fn testsuite_archive(&self, cookie: &str) -> Result<Vec<u8>> {
        let suite = {
            let entry = self.entry(cookie).await?;
            let job = entry.lock().await;
            job.testsuite()
                .cloned()
                .ok_or_else(|| LabError::NoTestsuite(cookie.to_string()))?
        };
        suite.archive()
    }

    /// Stop `cookie`'s host from PXE booting again.
    #[tracing::instrument(skip(self))]
    pub async fn disable_pxe(&self, cookie: &str) -> Result<()> {
        let (host, profile) = {
            let entry = self.entry(cookie).await?;
            let job = entry.lock().await;
            (job.host().clone(), job.profile().clone())
        };
        profile.enable_pxe(host.as_ref(), false).await
    }

    /// The script a booted host runs. Fetching it means the host came up, so
    /// PXE is disabled on the way.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap_script(&self, cookie: &str) -> Result<String> {
        let (host, profile, current_step, testsuite) = {
            let entry = self.entry(cookie).await?;
            let job = entry.lock().await;
            if job.testsuite().is_none() {
                return Err(LabError::NoTestsuite(cookie.to_string()));
            }
            (
                job.host().clone(),
                job.profile().clone(),
                job.current_step(),
                job.testsuite_name().to_string(),
            )
        };
        profile.enable_pxe(host.as_ref(), false).await?;
        debug!("center: handing out bootstrap script for {}", cookie);
        Ok(self.bootstrap.render(cookie, current_step, &testsuite))
    }

    /// Snapshots of every job, oldest first.
    pub async fn get_jobs(&self) -> Vec<JobRecord> {
        let entries: Vec<JobEntry> = self.jobs.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.record());
        }
        records.sort_by(|a, b| a.created_at().cmp(b.created_at()));
        records
    }

    pub async fn job(&self, cookie: &str) -> Result<JobRecord> {
        let entry = self.entry(cookie).await?;
        let record = entry.lock().await.record();
        Ok(record)
    }

    /// Reload persisted jobs, resolving their names through `inventory`.
    /// Returns how many jobs were recovered.
    #[tracing::instrument(skip(self, inventory))]
    pub async fn recover(&self, inventory: &Inventory) -> Result<usize> {
        let stored = self.sessions.load_all().await?;
        if stored.is_empty() {
            return Ok(0);
        }
        let testsuites = inventory.testsuites().await;
        let profiles = inventory.profiles().await;
        let hosts = inventory.hosts().await;

        let mut recovered = 0;
        for stored in stored {
            let record = stored.record;
            let cookie = record.cookie().clone();
            let Some(profile) = profiles.get(record.profile()).cloned() else {
                warn!(
                    "center: not recovering {}: unknown profile {}",
                    cookie,
                    record.profile()
                );
                continue;
            };
            let Some(host) = hosts.get(record.host()).cloned() else {
                warn!("center: not recovering {}: unknown host {}", cookie, record.host());
                continue;
            };
            let testsuite = testsuites.get(record.testsuite()).cloned();
            if testsuite.is_none() {
                warn!(
                    "center: recovering {} without its testsuite {}",
                    cookie,
                    record.testsuite()
                );
            }
            let host = host.for_job(&cookie, &self.sessions.job_dir(&cookie));
            let job = match Job::restore(record, testsuite, profile, host, stored.artifacts) {
                Ok(job) => job,
                Err(e) => {
                    warn!("center: not recovering {}: {}", cookie, e);
                    continue;
                }
            };
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&cookie) {
                warn!("center: job {} already known, not recovering it", cookie);
                continue;
            }
            jobs.insert(cookie, Arc::new(Mutex::new(job)));
            recovered += 1;
        }
        info!("center: recovered {} jobs", recovered);
        Ok(recovered)
    }
}

fn log_stale(cookie: &str, e: LabError) -> LabError {
    if e.is_stale_callback() {
        warn!("center: ignoring stale callback for {}: {}", cookie, e);
    }
    e
}

/// Leave the host as it was before the job: no PXE, no profile, and for
/// virtual hosts no domain.
async fn teardown(cookie: &str, host: &dyn Host, profile: &dyn Profile) {
    if let Err(e) = profile.enable_pxe(host, false).await {
        warn!("center: {}: disabling PXE on {} failed: {}", cookie, host.name(), e);
    }
    if let Err(e) = profile.revoke_from(host).await {
        warn!(
            "center: {}: revoking {} from {} failed: {}",
            cookie,
            profile.name(),
            host.name(),
            e
        );
    }
    if !host.is_virtual() {
        return;
    }
    if let Err(e) = host.shutdown().await {
        warn!("center: {}: shutting down {} failed: {}", cookie, host.name(), e);
    }
    if let Err(e) = host.undefine().await {
        warn!("center: {}: undefining {} failed: {}", cookie, host.name(), e);
    }
    if let Err(e) = host.remove_images().await {
        warn!("center: {}: removing images of {} failed: {}", cookie, host.name(), e);
    }
}

#[cfg(test)]
mod tests {
    use crate::job::StepStatus;
    use crate::testing::*;

    use super::*;

    fn center(dir: &tempfile::TempDir) -> Arc<JobCenter> {
        Arc::new(JobCenter::new(SessionStore::new(dir.path())))
    }

    #[tokio::test]
    async fn test_that_submitted_jobs_get_unique_cookies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let a = center.submit(spec_with_cases(1), None).await?;
        let b = center.submit(spec_with_cases(1), None).await?;
        assert_ne!(a.cookie(), b.cookie());
        assert_eq!(COOKIE_LENGTH, a.cookie().len());
        assert!(a
            .cookie()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(&JobStatus::Created, a.status());
        assert_eq!(2, center.get_jobs().await.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_requested_cookies_must_be_free_and_safe() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        center
            .submit(spec_with_cases(1), Some("nightly-1".into()))
            .await?;
        assert!(matches!(
            center.submit(spec_with_cases(1), Some("nightly-1".into())).await,
            Err(LabError::CookieConflict(_))
        ));
        assert!(matches!(
            center.submit(spec_with_cases(1), Some("../x".into())).await,
            Err(LabError::InvalidRequest(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_a_job_runs_to_completion() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let profile = FakeProfile::new("fedora-minimal");
        let host = FakeHost::new("rack1");
        let cookie = center
            .submit(spec_for(2, profile.clone(), host.clone()), None)
            .await?
            .cookie()
            .clone();

        center.provision_job(&cookie).await?;
        assert_eq!(Some(true), profile.pxe_enabled("rack1"));
        assert_eq!(vec!["reboot"], host.calls());

        let record = center.start_job(&cookie).await?;
        assert_eq!(Some(false), profile.pxe_enabled("rack1"));
        assert_eq!(&JobStatus::Running, record.status());

        center.finish_test_step(&cookie, 0, true, None).await?;
        let record = center
            .finish_test_step(&cookie, 1, false, Some("exit 1".into()))
            .await?;
        assert_eq!(&JobStatus::Completed, record.status());
        assert_eq!(&Some(false), record.passed());
        assert_eq!(
            &StepStatus::Failure,
            center.step_result(&cookie, 1).await?.status()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_that_virtual_hosts_are_created_and_booted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let host = FakeHost::virtual_host("vm1");
        let cookie = center
            .submit(spec_for(1, FakeProfile::new("f40"), host.clone()), None)
            .await?
            .cookie()
            .clone();
        center.provision_job(&cookie).await?;
        assert_eq!(vec!["create_images", "define", "boot"], host.calls());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_provisioning_failures_surface() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let host = FakeHost::new("rack1");
        host.fail_boot();
        let cookie = center
            .submit(spec_for(1, FakeProfile::new("f40"), host), None)
            .await?
            .cookie()
            .clone();
        assert!(matches!(
            center.provision_job(&cookie).await,
            Err(LabError::Backend { .. })
        ));
        assert_eq!(&JobStatus::Created, center.job(&cookie).await?.status());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_stale_step_reports_do_not_change_the_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let cookie = center.submit(spec_with_cases(3), None).await?.cookie().clone();
        center.start_job(&cookie).await?;
        center.finish_test_step(&cookie, 0, true, None).await?;
        let before = center.job(&cookie).await?;
        assert!(matches!(
            center.finish_test_step(&cookie, 0, true, None).await,
            Err(LabError::StepMismatch { .. })
        ));
        assert_eq!(before, center.job(&cookie).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_that_abort_tears_down_virtual_hosts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let profile = FakeProfile::new("f40");
        let host = FakeHost::virtual_host("vm1");
        let cookie = center
            .submit(spec_for(2, profile.clone(), host.clone()), None)
            .await?
            .cookie()
            .clone();
        center.start_job(&cookie).await?;

        let record = center.abort_job(&cookie).await?;
        assert_eq!(&JobStatus::Aborted, record.status());
        assert_eq!(&StepStatus::Failure, record.steps()[0].status());
        assert_eq!(vec!["shutdown", "undefine", "remove_images"], host.calls());
        assert!(profile.calls().contains(&"revoke vm1".to_string()));
        assert!(matches!(
            center.abort_job(&cookie).await,
            Err(LabError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            center.start_job(&cookie).await,
            Err(LabError::AlreadyTerminal { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_physical_hosts_stay_defined_after_abort() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let host = FakeHost::new("rack1");
        let cookie = center
            .submit(spec_for(1, FakeProfile::new("f40"), host.clone()), None)
            .await?
            .cookie()
            .clone();
        center.abort_job(&cookie).await?;
        assert!(host.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_step_results_after_an_abort_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let cookie = center.submit(spec_with_cases(2), None).await?.cookie().clone();
        center.start_job(&cookie).await?;
        center.abort_job(&cookie).await?;

        assert!(matches!(
            center.finish_test_step(&cookie, 0, true, None).await,
            Err(LabError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            center.skip_step(&cookie, 0).await,
            Err(LabError::AlreadyTerminal { .. })
        ));
        let record = center.job(&cookie).await?;
        assert_eq!(&JobStatus::Aborted, record.status());
        assert_eq!(&StepStatus::Failure, record.steps()[0].status());
        assert_eq!(&None, record.passed());
        Ok(())
    }

    /// Smoke test: whichever call wins, the loser sees a terminal job.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_that_racing_abort_and_finish_agree() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        for _ in 0..20 {
            let cookie = center.submit(spec_with_cases(1), None).await?.cookie().clone();
            center.start_job(&cookie).await?;

            let finish = {
                let center = center.clone();
                let cookie = cookie.clone();
                tokio::spawn(async move { center.finish_test_step(&cookie, 0, true, None).await })
            };
            let abort = {
                let center = center.clone();
                let cookie = cookie.clone();
                tokio::spawn(async move { center.abort_job(&cookie).await })
            };
            let finish = finish.await.expect("finish task");
            let abort = abort.await.expect("abort task");

            let record = center.job(&cookie).await?;
            match (finish, abort) {
                (Ok(_), Err(LabError::AlreadyTerminal { .. })) => {
                    assert_eq!(&JobStatus::Completed, record.status());
                }
                (Err(LabError::AlreadyTerminal { .. }), Ok(_)) => {
                    assert_eq!(&JobStatus::Aborted, record.status());
                }
                (finish, abort) => panic!("unexpected outcome: {finish:?} / {abort:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_that_artifacts_are_stored_per_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let cookie = center.submit(spec_with_cases(2), None).await?.cookie().clone();
        assert!(matches!(
            center.add_artifact(&cookie, "log.txt", b"early".to_vec()).await,
            Err(LabError::InvalidRequest(_))
        ));
        center.start_job(&cookie).await?;
        let stored = center.add_artifact(&cookie, "log.txt", b"hello".to_vec()).await?;
        assert_eq!(&0, stored.step());
        assert_eq!(&5, stored.size());
        assert_eq!(b"hello".to_vec(), center.get_artifact(&cookie, "log.txt").await?);
        assert!(dir
            .path()
            .join(&cookie)
            .join("artifacts/0/log.txt")
            .exists());
        assert!(center.artifacts_archive(&cookie).await?.is_some());
        let replaced = center.add_artifact(&cookie, "log.txt", b"hi".to_vec()).await?;
        assert_eq!(&2, replaced.size());
        assert_eq!(vec![replaced], center.list_artifacts(&cookie).await?);
        assert!(matches!(
            center.add_artifact(&cookie, "a/b", vec![]).await,
            Err(LabError::InvalidName(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_bootstrap_disables_pxe_and_names_the_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = center(&dir);
        let profile = FakeProfile::new("f40");
        let cookie = center
            .submit(spec_for(1, profile.clone(), FakeHost::new("rack1")), None)
            .await?
            .cookie()
            .clone();
        center.provision_job(&cookie).await?;
        let script = center.bootstrap_script(&cookie).await?;
        assert!(script.contains(&format!("COOKIE=\"{cookie}\"")));
        assert!(script.contains("TESTSUITE=\"generated\""));
        assert_eq!(Some(false), profile.pxe_enabled("rack1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_unknown_cookies_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let center = center(&dir);
        assert!(matches!(
            center.start_job("nope").await,
            Err(LabError::NotFound { kind: "job", .. })
        ));
        assert!(matches!(
            center.annotate("nope", b"x").await,
            Err(LabError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_that_jobs_are_recovered_after_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let inventory = Inventory::new()
            .with_testsuites("files", suites_origin(vec![suite_with_cases(2)]))
            .with_profiles("files", profiles_origin(vec![FakeProfile::new("fedora-minimal")]))
            .with_hosts("files", hosts_origin(vec![FakeHost::new("vm1")]));

        let cookie = {
            let center = center(&dir);
            let cookie = center.submit(spec_with_cases(2), None).await?.cookie().clone();
            center.start_job(&cookie).await?;
            center.add_artifact(&cookie, "log.txt", b"hello".to_vec()).await?;
            center.finish_test_step(&cookie, 0, true, None).await?;
            center.annotate(&cookie, b"step 0 done\n").await?;
            cookie
        };

        let center = center(&dir);
        assert_eq!(1, center.recover(&inventory).await?);
        let record = center.job(&cookie).await?;
        assert_eq!(&JobStatus::Running, record.status());
        assert_eq!(&1, record.current_step());
        assert_eq!("step 0 done\n", record.annotations().as_str());
        assert_eq!(b"hello".to_vec(), center.get_artifact(&cookie, "log.txt").await?);
        center.finish_test_step(&cookie, 1, true, None).await?;
        assert!(center.testsuite_archive(&cookie).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_recovery_tolerates_missing_inventory_items() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let center = center(&dir);
            center.submit(spec_with_cases(1), Some("keep".into())).await?;
            let lost = spec_for(1, FakeProfile::new("gone"), FakeHost::new("vm1"));
            center.submit(lost, Some("lost".into())).await?;
        }
        // No testsuites at all: jobs come back without one.
        let inventory = Inventory::new()
            .with_profiles("files", profiles_origin(vec![FakeProfile::new("fedora-minimal")]))
            .with_hosts("files", hosts_origin(vec![FakeHost::new("vm1")]));
        let center = center(&dir);
        assert_eq!(1, center.recover(&inventory).await?);
        assert!(matches!(
            center.job("lost").await,
            Err(LabError::NotFound { .. })
        ));
        assert!(matches!(
            center.testsuite_archive("keep").await,
            Err(LabError::NoTestsuite(_))
        ));
        assert!(matches!(
            center.bootstrap_script("keep").await,
            Err(LabError::NoTestsuite(_))
        ));
        Ok(())
    }
}
