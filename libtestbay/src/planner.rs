//! Test plan execution. Submitting a plan creates one job per rendered job
//! layout and provisions it; a [`PlanWorker`] remembers which jobs belong to
//! the plan so their status can be aggregated or aborted together.

use std::collections::BTreeMap;

use derive_getters::Getters;
use serde::Serialize;
use time::OffsetDateTime;

use crate::center::JobCenter;
use crate::error::{LabError, Result};
use crate::inventory::Inventory;
use crate::job::{JobRecord, JobStatus};
use crate::log::*;
use crate::testplan::{Testplan, Variable};

/// Bookkeeping for one submitted plan.
#[derive(Getters, Debug, Clone)]
pub struct PlanWorker {
    plan: String,
    cookies: Vec<String>,
    variables: BTreeMap<String, Variable>,
    aborted: bool,
    /// Jobs are still being submitted; `cookies` is incomplete.
    submitting: bool,
    started_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    Running,
    Completed,
    Aborted,
}

#[derive(Getters, Debug, Clone, Serialize)]
pub struct PlanStatus {
    plan: String,
    status: PlanState,
    /// Every job completed without failed steps.
    passed: bool,
    aborted: bool,
    variables: BTreeMap<String, Variable>,
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    jobs: Vec<JobRecord>,
}

impl PlanStatus {
    fn new(worker: PlanWorker, jobs: Vec<JobRecord>) -> Self {
        let status = if worker.submitting || jobs.iter().any(|job| !job.status().is_terminal()) {
            PlanState::Running
        } else if worker.aborted || jobs.iter().any(|job| job.status() == &JobStatus::Aborted) {
            PlanState::Aborted
        } else {
            PlanState::Completed
        };
        let passed = status == PlanState::Completed
            && jobs.iter().all(|job| job.passed() == &Some(true));
        Self {
            plan: worker.plan,
            status,
            passed,
            aborted: worker.aborted,
            variables: worker.variables,
            started_at: worker.started_at,
            jobs,
        }
    }
}

impl JobCenter {
    /// Run `plan` with `overrides` taking precedence over its variables. All
    /// job layouts are resolved before anything is submitted, so a plan
    /// referring to unknown items leaves no jobs behind.
    #[tracing::instrument(skip(self, inventory, plan), fields(plan = %plan.name()))]
    pub async fn submit_plan(
        &self,
        inventory: &Inventory,
        plan: &Testplan,
        overrides: &BTreeMap<String, String>,
    ) -> Result<PlanStatus> {
        let overrides: BTreeMap<String, Variable> = overrides
            .iter()
            .map(|(key, value)| (key.clone(), Variable::from_override(value)))
            .collect();
        let requests = plan.expand(&overrides)?;
        let mut specs = Vec::with_capacity(requests.len());
        for request in &requests {
            specs.push(inventory.resolve(request).await?);
        }

        let mut variables = plan.variables().clone();
        variables.extend(overrides);

        let started_at = self.reserve_plan(plan.name(), variables).await?;
        let mut cookies = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.submit(spec, None).await {
                Ok(record) => cookies.push(record.cookie().clone()),
                Err(e) => {
                    error!("planner: submitting a job of {} failed: {}", plan.name(), e);
                    for cookie in &cookies {
                        if let Err(e) = self.abort_job(cookie).await {
                            warn!("planner: aborting {} failed: {}", cookie, e);
                        }
                    }
                    let mut plans = self.plans.write().await;
                    if plans.get(plan.name()).map(|w| w.started_at) == Some(started_at) {
                        plans.remove(plan.name());
                    }
                    return Err(e);
                }
            }
        }

        let aborted = {
            let mut plans = self.plans.write().await;
            match plans.get_mut(plan.name()) {
                Some(worker) if worker.started_at == started_at => {
                    worker.cookies = cookies.clone();
                    worker.submitting = false;
                    worker.aborted
                }
                _ => true,
            }
        };
        if aborted {
            info!("planner: plan {} was aborted while submitting", plan.name());
            for cookie in &cookies {
                if let Err(e) = self.abort_job(cookie).await {
                    warn!("planner: aborting {} failed: {}", cookie, e);
                }
            }
            return self.status_plan(plan.name()).await;
        }
        info!("planner: plan {} submitted {} jobs", plan.name(), cookies.len());

        for cookie in &cookies {
            if let Err(e) = self.provision_job(cookie).await {
                error!("planner: provisioning {} failed, aborting it: {}", cookie, e);
                if let Err(e) = self.abort_job(cookie).await {
                    warn!("planner: aborting {} failed: {}", cookie, e);
                }
            }
        }
        self.status_plan(plan.name()).await
    }

    pub async fn status_plan(&self, name: &str) -> Result<PlanStatus> {
        let worker = self
            .plans
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::not_found("testplan", name))?;
        let jobs = self.worker_jobs(&worker).await;
        Ok(PlanStatus::new(worker, jobs))
    }

    /// Abort every unfinished job of plan `name`.
    #[tracing::instrument(skip(self))]
    pub async fn abort_plan(&self, name: &str) -> Result<PlanStatus> {
        let cookies = {
            let mut plans = self.plans.write().await;
            let worker = plans
                .get_mut(name)
                .ok_or_else(|| LabError::not_found("testplan", name))?;
            worker.aborted = true;
            worker.cookies.clone()
        };
        for cookie in &cookies {
            match self.job(cookie).await {
                Ok(record) if record.status().is_terminal() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!("planner: can't look up {}: {}", cookie, e);
                    continue;
                }
            }
            if let Err(e) = self.abort_job(cookie).await {
                warn!("planner: aborting {} failed: {}", cookie, e);
            }
        }
        info!("planner: plan {} aborted", name);
        self.status_plan(name).await
    }

    /// Claim `name` for a new worker without any jobs yet. Fails if a
    /// previous worker of the same plan is still submitting or running.
    async fn reserve_plan(
        &self,
        name: &str,
        variables: BTreeMap<String, Variable>,
    ) -> Result<OffsetDateTime> {
        let still_running = || LabError::InvalidRequest(format!("plan '{name}' is still running"));
        let previous = self.plans.read().await.get(name).cloned();
        if let Some(previous) = &previous {
            if previous.submitting || self.worker_state(previous).await == PlanState::Running {
                return Err(still_running());
            }
            debug!("planner: replacing finished worker of {}", name);
        }

        let mut plans = self.plans.write().await;
        let current = plans.get(name).map(|worker| worker.started_at);
        if current != previous.map(|worker| worker.started_at) {
            return Err(still_running());
        }
        let started_at = OffsetDateTime::now_utc();
        plans.insert(
            name.to_string(),
            PlanWorker {
                plan: name.to_string(),
                cookies: vec![],
                variables,
                aborted: false,
                submitting: true,
                started_at,
            },
        );
        Ok(started_at)
    }

    /// Names of all plans that were submitted since startup.
    pub async fn plan_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plans.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn worker_jobs(&self, worker: &PlanWorker) -> Vec<JobRecord> {
        let mut jobs = Vec::with_capacity(worker.cookies.len());
        for cookie in &worker.cookies {
            match self.job(cookie).await {
                Ok(record) => jobs.push(record),
                Err(e) => warn!("planner: {} of {} vanished: {}", cookie, worker.plan, e),
            }
        }
        jobs
    }

    async fn worker_state(&self, worker: &PlanWorker) -> PlanState {
        let jobs = self.worker_jobs(worker).await;
        *PlanStatus::new(worker.clone(), jobs).status()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::hooks::Hooks;
    use crate::session::SessionStore;
    use crate::testing::*;
    use crate::testplan::JobLayout;

    use super::*;

    fn inventory(hosts: Vec<Arc<FakeHost>>) -> Inventory {
        Inventory::new()
            .with_testsuites("files", suites_origin(vec![smoke_suite()]))
            .with_profiles("files", profiles_origin(vec![FakeProfile::new("fedora-minimal")]))
            .with_hosts("files", hosts_origin(hosts))
    }

    fn nightly() -> Testplan {
        Testplan::new(
            "nightly",
            vec![JobLayout::new("smoke", "fedora-minimal", "{host}")],
        )
        .with_variable("host", Variable::One("vm1".into()))
    }

    fn both_hosts() -> BTreeMap<String, String> {
        let mut overrides = BTreeMap::new();
        overrides.insert("host".to_string(), "vm1,vm2".to_string());
        overrides
    }

    async fn run_through(center: &JobCenter, cookie: &str, steps: usize) -> Result<()> {
        center.start_job(cookie).await?;
        for n in 0..steps {
            center.finish_test_step(cookie, n, true, None).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_that_plans_run_one_job_per_binding() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = JobCenter::new(SessionStore::new(dir.path()));
        let vm1 = FakeHost::new("vm1");
        let vm2 = FakeHost::new("vm2");
        let inventory = inventory(vec![vm1.clone(), vm2.clone()]);

        let status = center
            .submit_plan(&inventory, &nightly(), &both_hosts())
            .await?;
        assert_eq!(&PlanState::Running, status.status());
        let hosts: Vec<&str> = status.jobs().iter().map(|j| j.host().as_str()).collect();
        assert_eq!(vec!["vm1", "vm2"], hosts);
        assert_eq!(vec!["reboot"], vm1.calls());
        assert_eq!(vec!["reboot"], vm2.calls());

        for job in status.jobs() {
            run_through(&center, job.cookie(), 3).await?;
        }
        let status = center.status_plan("nightly").await?;
        assert_eq!(&PlanState::Completed, status.status());
        assert!(*status.passed());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_aborting_a_partly_done_plan_aborts_it() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = JobCenter::new(SessionStore::new(dir.path()));
        let inventory = inventory(vec![FakeHost::new("vm1"), FakeHost::new("vm2")]);
        let status = center
            .submit_plan(&inventory, &nightly(), &both_hosts())
            .await?;
        let done = status.jobs()[0].cookie().clone();
        let busy = status.jobs()[1].cookie().clone();
        run_through(&center, &done, 3).await?;
        center.start_job(&busy).await?;

        let status = center.abort_plan("nightly").await?;
        assert_eq!(&PlanState::Aborted, status.status());
        assert!(!*status.passed());
        assert_eq!(&JobStatus::Completed, center.job(&done).await?.status());
        assert_eq!(&JobStatus::Aborted, center.job(&busy).await?.status());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_bad_references_submit_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = JobCenter::new(SessionStore::new(dir.path()));
        let inventory = inventory(vec![FakeHost::new("vm1")]);
        let err = center
            .submit_plan(&inventory, &nightly(), &both_hosts())
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::NotFound { kind: "host", .. }));
        assert!(center.get_jobs().await.is_empty());
        assert!(matches!(
            center.status_plan("nightly").await,
            Err(LabError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_running_plans_are_not_replaced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = JobCenter::new(SessionStore::new(dir.path()));
        let inventory = inventory(vec![FakeHost::new("vm1")]);
        let no_overrides = BTreeMap::new();
        center
            .submit_plan(&inventory, &nightly(), &no_overrides)
            .await?;
        assert!(matches!(
            center.submit_plan(&inventory, &nightly(), &no_overrides).await,
            Err(LabError::InvalidRequest(_))
        ));

        center.abort_plan("nightly").await?;
        let status = center
            .submit_plan(&inventory, &nightly(), &no_overrides)
            .await?;
        assert_eq!(&PlanState::Running, status.status());
        assert_eq!(2, center.get_jobs().await.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_provisioning_failures_abort_only_that_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = JobCenter::new(SessionStore::new(dir.path()));
        let broken = FakeHost::new("vm2");
        broken.fail_boot();
        let inventory = inventory(vec![FakeHost::new("vm1"), broken]);
        let status = center
            .submit_plan(&inventory, &nightly(), &both_hosts())
            .await?;
        let states: Vec<JobStatus> = status.jobs().iter().map(|j| *j.status()).collect();
        assert_eq!(vec![JobStatus::Created, JobStatus::Aborted], states);
        assert_eq!(&PlanState::Running, status.status());
        Ok(())
    }

    async fn slow_hooks(dir: &std::path::Path) -> Result<Hooks> {
        let hooks = dir.join("hooks");
        tokio::fs::create_dir_all(&hooks).await?;
        let hook = hooks.join("10-slow");
        tokio::fs::write(&hook, "#!/bin/sh\nsleep 1\n").await?;
        tokio::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(Hooks::new(hooks))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_that_slow_submissions_do_not_block_other_plan_calls() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = Arc::new(
            JobCenter::new(SessionStore::new(dir.path().join("sessions")))
                .with_hooks(slow_hooks(dir.path()).await?),
        );
        let inventory = Arc::new(inventory(vec![FakeHost::new("vm1")]));
        let submitting = {
            let center = center.clone();
            let inventory = inventory.clone();
            tokio::spawn(async move {
                center
                    .submit_plan(&inventory, &nightly(), &BTreeMap::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let before = Instant::now();
        assert_eq!(vec!["nightly".to_string()], center.plan_names().await);
        let status = center.status_plan("nightly").await?;
        assert!(before.elapsed() < Duration::from_millis(500));
        assert_eq!(&PlanState::Running, status.status());
        assert!(matches!(
            center
                .submit_plan(&inventory, &nightly(), &BTreeMap::new())
                .await,
            Err(LabError::InvalidRequest(_))
        ));

        let status = submitting.await.expect("submit task")?;
        assert_eq!(1, status.jobs().len());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_that_plans_aborted_while_submitting_abort_their_jobs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let center = Arc::new(
            JobCenter::new(SessionStore::new(dir.path().join("sessions")))
                .with_hooks(slow_hooks(dir.path()).await?),
        );
        let inventory = Arc::new(inventory(vec![FakeHost::new("vm1")]));
        let submitting = {
            let center = center.clone();
            let inventory = inventory.clone();
            tokio::spawn(async move {
                center
                    .submit_plan(&inventory, &nightly(), &BTreeMap::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        center.abort_plan("nightly").await?;

        let status = submitting.await.expect("submit task")?;
        assert_eq!(&PlanState::Aborted, status.status());
        assert!(status
            .jobs()
            .iter()
            .all(|job| job.status() == &JobStatus::Aborted));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_unknown_plans_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let center = JobCenter::new(SessionStore::new(dir.path()));
        assert!(matches!(
            center.abort_plan("nope").await,
            Err(LabError::NotFound { kind: "testplan", .. })
        ));
    }
}
