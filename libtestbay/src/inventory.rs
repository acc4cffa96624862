//! Where hosts, profiles, test suites and test plans come from.
//!
//! Every backend contributes [`Origin`]s per category. The [`Inventory`]
//! merges all origins of a category into one namespace, in the order the
//! origins were added: when two backends list an item with the same name, the
//! backend added last wins.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::{LabError, Result};
use crate::host::Host;
use crate::job::JobSpec;
use crate::log::*;
use crate::profile::Profile;
use crate::testplan::{JobRequest, Testplan};
use crate::testsuite::Testsuite;

/// Files every new profile needs.
pub const PROFILE_FILES: [&str; 3] = ["kernel", "initrd", "kargs"];

/// Local files making up a new profile, keyed by role (`kernel`, `initrd`,
/// `kargs`).
pub type ProfileFiles = BTreeMap<String, PathBuf>;

/// Profile names become directory and Cobbler object names.
pub fn check_profile_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(LabError::InvalidRequest(format!("bad profile name '{name}'")));
    }
    Ok(())
}

/// The file playing `role` in a new profile.
pub fn profile_file<'a>(files: &'a ProfileFiles, role: &str) -> Result<&'a Path> {
    files
        .get(role)
        .map(PathBuf::as_path)
        .ok_or_else(|| LabError::InvalidPayload(format!("missing profile file {role}")))
}

/// A source of items of one category.
#[async_trait]
pub trait Origin<T: ?Sized + Send + Sync>: Send + Sync + fmt::Debug {
    async fn items(&self) -> Result<BTreeMap<String, Arc<T>>>;

    /// Verify the origin is usable. Called once at startup.
    async fn check(&self) -> Result<()> {
        self.items().await.map(|_| ())
    }
}

/// A source of profiles, optionally able to create new ones.
#[async_trait]
pub trait ProfileOrigin: Origin<dyn Profile> {
    async fn create_profile(&self, name: &str, files: &ProfileFiles) -> Result<()> {
        let _ = files;
        Err(LabError::InvalidRequest(format!(
            "this backend can't create profiles (requested '{name}')"
        )))
    }
}

type Origins<O> = Vec<(String, Arc<O>)>;

#[derive(Debug, Default)]
pub struct Inventory {
    plans: Origins<dyn Origin<Testplan>>,
    testsuites: Origins<dyn Origin<Testsuite>>,
    profiles: Origins<dyn ProfileOrigin>,
    hosts: Origins<dyn Origin<dyn Host>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans<S: Into<String>>(mut self, backend: S, origin: Arc<dyn Origin<Testplan>>) -> Self {
        self.plans.push((backend.into(), origin));
        self
    }

    pub fn with_testsuites<S: Into<String>>(
        mut self,
        backend: S,
        origin: Arc<dyn Origin<Testsuite>>,
    ) -> Self {
        self.testsuites.push((backend.into(), origin));
        self
    }

    pub fn with_profiles<S: Into<String>>(mut self, backend: S, origin: Arc<dyn ProfileOrigin>) -> Self {
        self.profiles.push((backend.into(), origin));
        self
    }

    pub fn with_hosts<S: Into<String>>(mut self, backend: S, origin: Arc<dyn Origin<dyn Host>>) -> Self {
        self.hosts.push((backend.into(), origin));
        self
    }

    pub async fn plans(&self) -> BTreeMap<String, Arc<Testplan>> {
        merge::<Testplan, _>("plans", &self.plans).await
    }

    pub async fn testsuites(&self) -> BTreeMap<String, Arc<Testsuite>> {
        merge::<Testsuite, _>("testsuites", &self.testsuites).await
    }

    pub async fn profiles(&self) -> BTreeMap<String, Arc<dyn Profile>> {
        merge::<dyn Profile, _>("profiles", &self.profiles).await
    }

    pub async fn hosts(&self) -> BTreeMap<String, Arc<dyn Host>> {
        merge::<dyn Host, _>("hosts", &self.hosts).await
    }

    pub async fn plan(&self, name: &str) -> Result<Arc<Testplan>> {
        self.plans()
            .await
            .remove(name)
            .ok_or_else(|| LabError::not_found("testplan", name))
    }

    pub async fn testsuite(&self, name: &str) -> Result<Arc<Testsuite>> {
        self.testsuites()
            .await
            .remove(name)
            .ok_or_else(|| LabError::not_found("testsuite", name))
    }

    pub async fn profile(&self, name: &str) -> Result<Arc<dyn Profile>> {
        self.profiles()
            .await
            .remove(name)
            .ok_or_else(|| LabError::not_found("profile", name))
    }

    pub async fn host(&self, name: &str) -> Result<Arc<dyn Host>> {
        self.hosts()
            .await
            .remove(name)
            .ok_or_else(|| LabError::not_found("host", name))
    }

    /// Resolve the names in `request` into a [`JobSpec`].
    pub async fn resolve(&self, request: &JobRequest) -> Result<JobSpec> {
        Ok(JobSpec::new(
            self.testsuite(request.testsuite()).await?,
            self.profile(request.profile()).await?,
            self.host(request.host()).await?,
            request.additional_kargs().clone(),
        ))
    }

    pub fn profile_backends(&self) -> Vec<&str> {
        self.profiles.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Create profile `name` on `backend` from `files`.
    #[tracing::instrument(skip(self))]
    pub async fn create_profile(&self, backend: &str, name: &str, files: &ProfileFiles) -> Result<()> {
        let (_, origin) = self
            .profiles
            .iter()
            .find(|(b, _)| b == backend)
            .ok_or_else(|| LabError::UnknownBackend(backend.to_string()))?;
        let missing: Vec<&str> = PROFILE_FILES
            .iter()
            .copied()
            .filter(|f| !files.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(LabError::InvalidPayload(format!(
                "missing profile files: {}",
                missing.join(", ")
            )));
        }
        info!("inventory: creating profile {} on {}", name, backend);
        origin.create_profile(name, files).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_profile(&self, name: &str) -> Result<()> {
        let profile = self.profile(name).await?;
        info!("inventory: deleting profile {} from {}", name, profile.backend());
        profile.delete().await
    }

    /// Validate every origin and every plan eagerly, so that configuration
    /// problems surface at startup rather than at the first request.
    #[tracing::instrument(skip(self))]
    pub async fn check(&self) -> Result<()> {
        check_origins::<Testplan, _>("plans", &self.plans).await?;
        check_origins::<Testsuite, _>("testsuites", &self.testsuites).await?;
        check_origins::<dyn Profile, _>("profiles", &self.profiles).await?;
        check_origins::<dyn Host, _>("hosts", &self.hosts).await?;

        let testsuites = self.testsuites().await;
        for (name, suite) in &testsuites {
            let problems = suite.validate();
            if !problems.is_empty() {
                return Err(LabError::InvalidRequest(format!(
                    "testsuite '{}' is invalid: {}",
                    name,
                    problems.join("; ")
                )));
            }
        }

        let profiles: BTreeSet<String> = self.profiles().await.into_keys().collect();
        let hosts: BTreeSet<String> = self.hosts().await.into_keys().collect();
        for (name, plan) in self.plans().await {
            for request in plan.expand(&BTreeMap::new())? {
                let unresolved = [
                    ("testsuite", request.testsuite(), testsuites.contains_key(request.testsuite())),
                    ("profile", request.profile(), profiles.contains(request.profile())),
                    ("host", request.host(), hosts.contains(request.host())),
                ];
                if let Some((kind, item, _)) = unresolved.iter().find(|(_, _, known)| !known) {
                    error!("inventory: plan {} refers to unknown {} {}", name, kind, item);
                    return Err(LabError::not_found(*kind, item.as_str()));
                }
            }
        }
        info!(
            "inventory: {} testsuites, {} profiles, {} hosts",
            testsuites.len(),
            profiles.len(),
            hosts.len()
        );
        Ok(())
    }
}

async fn merge<T, O>(kind: &str, origins: &[(String, Arc<O>)]) -> BTreeMap<String, Arc<T>>
where
    T: ?Sized + Send + Sync,
    O: ?Sized + Origin<T>,
{
    let listings = join_all(origins.iter().map(|(_, origin)| origin.items())).await;
    let mut merged = BTreeMap::new();
    for ((backend, _), listing) in origins.iter().zip(listings) {
        match listing {
            Ok(items) => {
                for (name, item) in items {
                    if merged.insert(name.clone(), item).is_some() {
                        debug!("inventory: {} {} overridden by {}", kind, name, backend);
                    }
                }
            }
            Err(e) => {
                warn!("inventory: skipping {} from {}: {}", kind, backend, e);
            }
        }
    }
    merged
}

async fn check_origins<T, O>(kind: &str, origins: &[(String, Arc<O>)]) -> Result<()>
where
    T: ?Sized + Send + Sync,
    O: ?Sized + Origin<T>,
{
    for (backend, origin) in origins {
        debug!("inventory: checking {} origin {}", kind, backend);
        origin.check().await.map_err(|e| {
            error!("inventory: {} origin {} failed its check: {}", kind, backend, e);
            e
        })?;
    }
    Ok(())
}
