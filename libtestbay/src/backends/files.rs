//! Inventory items kept as plain files.
//!
//! ```text
//! <testsuites>/smoke.suite      one testset file per line
//! <testsuites>/boot.set         one `path [timeout=N] [expect_failure=true]` per line
//! <testplans>/nightly.plan      YAML, see crate::testplan
//! <hosts>/rack1.host            YAML: mac, boot, reboot, shutdown command lines
//! <profiles>/<name>/{kernel,initrd,kargs}
//! ```
//!
//! Profiles boot over PXE: assigning one stages a pxelinux configuration for
//! the host's MAC address below the TFTP root, enabling PXE activates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;

use super::{path_list, FILES};
use crate::error::{LabError, Result};
use crate::host::{normalize_mac, Host};
use crate::inventory::{check_profile_name, profile_file, Origin, ProfileFiles, ProfileOrigin, PROFILE_FILES};
use crate::log::*;
use crate::process;
use crate::profile::{render_kargs, KargsCache, Profile};
use crate::testplan::Testplan;
use crate::testsuite::{Testcase, Testset, Testsuite};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilesConfig {
    #[serde(default, deserialize_with = "path_list")]
    pub testplans: Vec<PathBuf>,
    #[serde(default, deserialize_with = "path_list")]
    pub testsuites: Vec<PathBuf>,
    #[serde(default, deserialize_with = "path_list")]
    pub hosts: Vec<PathBuf>,
    #[serde(default, deserialize_with = "path_list")]
    pub profiles: Vec<PathBuf>,
    #[serde(default)]
    pub tftp_root: Option<PathBuf>,
}

/// Files in `dirs` ending in `.<extension>`, as (file stem, path) pairs.
async fn files_with_extension(dirs: &[PathBuf], extension: &str) -> Result<Vec<(String, PathBuf)>> {
    let mut found = vec![];
    for dir in dirs {
        let mut entries = fs::read_dir(dir).await.map_err(|e| {
            LabError::backend(FILES, format!("can't read {}: {}", dir.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path.clone()));
            }
        }
    }
    found.sort();
    Ok(found)
}

fn content_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn relative_to(file: &Path, entry: &str) -> PathBuf {
    file.parent()
        .map(|dir| dir.join(entry))
        .unwrap_or_else(|| PathBuf::from(entry))
}

#[derive(Debug)]
pub struct TestsuiteFiles {
    dirs: Vec<PathBuf>,
}

impl TestsuiteFiles {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    async fn read_suite(&self, name: &str, path: &Path) -> Result<Testsuite> {
        let content = fs::read_to_string(path).await?;
        let mut testsets = vec![];
        for set_file in content_lines(&content) {
            testsets.push(read_testset(&relative_to(path, set_file)).await?);
        }
        Ok(Testsuite::new(name, testsets))
    }
}

async fn read_testset(path: &Path) -> Result<Testset> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| LabError::InvalidRequest(format!("bad testset path {}", path.display())))?;
    let content = fs::read_to_string(path).await.map_err(|e| {
        LabError::backend(FILES, format!("can't read testset {}: {}", path.display(), e))
    })?;
    let mut testcases = vec![];
    for line in content_lines(&content) {
        let words = shell_words::split(line)
            .map_err(|e| LabError::InvalidRequest(format!("{}: {}", path.display(), e)))?;
        let Some((case, options)) = words.split_first() else {
            continue;
        };
        let case_path = relative_to(path, case);
        let case_name = case_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LabError::InvalidRequest(format!("bad testcase path {case}")))?
            .to_string();
        let source = fs::read_to_string(&case_path).await.map_err(|e| {
            LabError::backend(FILES, format!("can't read testcase {}: {}", case_path.display(), e))
        })?;
        let mut testcase = Testcase::new(case_name, source);
        for option in options {
            testcase = match option.split_once('=') {
                Some(("timeout", value)) => testcase.with_timeout(value.parse().map_err(|_| {
                    LabError::InvalidRequest(format!("{}: bad timeout '{}'", path.display(), value))
                })?),
                Some(("expect_failure", value)) => {
                    testcase.with_expect_failure(matches!(value, "true" | "yes" | "1"))
                }
                _ => {
                    return Err(LabError::InvalidRequest(format!(
                        "{}: unknown testcase option '{}'",
                        path.display(),
                        option
                    )))
                }
            };
        }
        testcases.push(testcase);
    }
    Ok(Testset::new(name, testcases))
}

#[async_trait]
impl Origin<Testsuite> for TestsuiteFiles {
    async fn items(&self) -> Result<BTreeMap<String, Arc<Testsuite>>> {
        let mut suites = BTreeMap::new();
        for (name, path) in files_with_extension(&self.dirs, "suite").await? {
            match self.read_suite(&name, &path).await {
                Ok(suite) => {
                    suites.insert(name, Arc::new(suite));
                }
                Err(e) => warn!("files: skipping testsuite {}: {}", name, e),
            }
        }
        Ok(suites)
    }
}

#[derive(Debug)]
pub struct TestplanFiles {
    dirs: Vec<PathBuf>,
}

impl TestplanFiles {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl Origin<Testplan> for TestplanFiles {
    async fn items(&self) -> Result<BTreeMap<String, Arc<Testplan>>> {
        let mut plans = BTreeMap::new();
        for (name, path) in files_with_extension(&self.dirs, "plan").await? {
            let content = fs::read_to_string(&path).await?;
            let plan = Testplan::from_yaml(name.clone(), &content)?;
            plans.insert(name, Arc::new(plan));
        }
        Ok(plans)
    }
}

fn default_command_timeout() -> u64 {
    process::DEFAULT_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
struct HostFile {
    #[serde(default)]
    mac: Option<String>,
    #[serde(default)]
    boot: Option<String>,
    #[serde(default)]
    reboot: Option<String>,
    #[serde(default)]
    shutdown: Option<String>,
    #[serde(default = "default_command_timeout")]
    timeout_secs: u64,
}

/// A physical machine powered through configurable command lines, e.g.
/// `ipmitool` calls against its BMC.
#[derive(Debug)]
pub struct CommandHost {
    name: String,
    mac: Option<String>,
    boot: Option<String>,
    reboot: Option<String>,
    shutdown: Option<String>,
    timeout: Duration,
}

impl CommandHost {
    fn from_file(name: &str, file: HostFile) -> Result<Self> {
        let mac = match file.mac {
            Some(mac) => Some(normalize_mac(&mac).ok_or_else(|| {
                LabError::InvalidRequest(format!("host {name}: bad MAC address '{mac}'"))
            })?),
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            mac,
            boot: file.boot,
            reboot: file.reboot,
            shutdown: file.shutdown,
            timeout: Duration::from_secs(file.timeout_secs),
        })
    }

    async fn run(&self, action: &str, command_line: &Option<String>) -> Result<()> {
        let command_line = command_line.as_deref().ok_or_else(|| {
            LabError::backend(FILES, format!("host {} has no {} command", self.name, action))
        })?;
        info!("files: {} {}: {}", action, self.name, command_line);
        process::run_command_line(FILES, command_line, self.timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl Host for CommandHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        FILES
    }

    fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    fn for_job(self: Arc<Self>, _cookie: &str, _session_dir: &Path) -> Arc<dyn Host> {
        self
    }

    async fn boot(&self) -> Result<()> {
        self.run("boot", &self.boot).await
    }

    async fn reboot(&self) -> Result<()> {
        if self.reboot.is_none() && self.boot.is_some() {
            if self.shutdown.is_some() {
                self.shutdown().await?;
            }
            return self.boot().await;
        }
        self.run("reboot", &self.reboot).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.run("shutdown", &self.shutdown).await
    }
}

#[derive(Debug)]
pub struct HostFiles {
    dirs: Vec<PathBuf>,
}

impl HostFiles {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl Origin<dyn Host> for HostFiles {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Host>>> {
        let mut hosts: BTreeMap<String, Arc<dyn Host>> = BTreeMap::new();
        for (name, path) in files_with_extension(&self.dirs, "host").await? {
            let content = fs::read_to_string(&path).await?;
            let file: HostFile = serde_yaml::from_str(&content)?;
            hosts.insert(name.clone(), Arc::new(CommandHost::from_file(&name, file)?));
        }
        Ok(hosts)
    }
}

const TFTP_PREFIX: &str = "testbay";

/// `01-aa-bb-cc-dd-ee-ff`, the name pxelinux looks up for a MAC address.
fn pxe_config_name(host: &dyn Host) -> Result<String> {
    let mac = host
        .mac()
        .and_then(normalize_mac)
        .ok_or_else(|| LabError::InvalidRequest(format!("host {} has no MAC address", host.name())))?;
    Ok(format!("01-{}", mac.replace(':', "-")))
}

fn pxelinux_config(profile: &str, kargs: &str) -> String {
    format!(
        "DEFAULT {TFTP_PREFIX}\n\
         LABEL {TFTP_PREFIX}\n\
         \x20 KERNEL {TFTP_PREFIX}/{profile}/kernel\n\
         \x20 APPEND initrd={TFTP_PREFIX}/{profile}/initrd {kargs}\n"
    )
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug)]
pub struct PxeProfile {
    name: String,
    dir: PathBuf,
    tftp_root: PathBuf,
    base_kargs: String,
    cache: Arc<KargsCache>,
}

impl PxeProfile {
    fn staged(&self, config_name: &str) -> PathBuf {
        self.tftp_root
            .join(TFTP_PREFIX)
            .join("staged")
            .join(config_name)
    }

    fn active(&self, config_name: &str) -> PathBuf {
        self.tftp_root.join("pxelinux.cfg").join(config_name)
    }
}

#[async_trait]
impl Profile for PxeProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        FILES
    }

    fn kargs(&self, additional: &str) -> String {
        self.cache.join(&self.base_kargs, additional)
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn assign_to(&self, host: &dyn Host, cookie: &str, additional_kargs: &str) -> Result<()> {
        let config_name = pxe_config_name(host)?;
        let images = self.tftp_root.join(TFTP_PREFIX).join(&self.name);
        fs::create_dir_all(&images).await?;
        for image in ["kernel", "initrd"] {
            fs::copy(self.dir.join(image), images.join(image)).await?;
        }
        let staged = self.staged(&config_name);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).await?;
        }
        let kargs = render_kargs(&self.kargs(additional_kargs), cookie);
        fs::write(&staged, pxelinux_config(&self.name, &kargs)).await?;
        debug!("files: staged {} for {}", staged.display(), host.name());
        Ok(())
    }

    async fn revoke_from(&self, host: &dyn Host) -> Result<()> {
        let config_name = pxe_config_name(host)?;
        remove_if_present(&self.active(&config_name)).await?;
        remove_if_present(&self.staged(&config_name)).await
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn enable_pxe(&self, host: &dyn Host, enable: bool) -> Result<()> {
        let config_name = pxe_config_name(host)?;
        let active = self.active(&config_name);
        if !enable {
            return remove_if_present(&active).await;
        }
        let staged = self.staged(&config_name);
        if fs::metadata(&staged).await.is_err() {
            return Err(LabError::InvalidRequest(format!(
                "profile {} was never assigned to {}",
                self.name,
                host.name()
            )));
        }
        if let Some(parent) = active.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&staged, &active).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!("files: removing profile {}", self.dir.display());
        fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PxeProfiles {
    dirs: Vec<PathBuf>,
    tftp_root: PathBuf,
    cache: Arc<KargsCache>,
}

impl PxeProfiles {
    pub fn new(dirs: Vec<PathBuf>, tftp_root: PathBuf) -> Self {
        Self {
            dirs,
            tftp_root,
            cache: Arc::new(KargsCache::new()),
        }
    }

    async fn read_profile(&self, name: &str, dir: &Path) -> Result<PxeProfile> {
        for file in PROFILE_FILES {
            if fs::metadata(dir.join(file)).await.is_err() {
                return Err(LabError::backend(
                    FILES,
                    format!("profile {} lacks its {} file", name, file),
                ));
            }
        }
        let base_kargs = fs::read_to_string(dir.join("kargs")).await?;
        Ok(PxeProfile {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            tftp_root: self.tftp_root.clone(),
            base_kargs: base_kargs.trim().to_string(),
            cache: self.cache.clone(),
        })
    }
}

#[async_trait]
impl Origin<dyn Profile> for PxeProfiles {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Profile>>> {
        let mut profiles: BTreeMap<String, Arc<dyn Profile>> = BTreeMap::new();
        for dir in &self.dirs {
            let mut entries = fs::read_dir(dir).await.map_err(|e| {
                LabError::backend(FILES, format!("can't read {}: {}", dir.display(), e))
            })?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                match self.read_profile(&name, &entry.path()).await {
                    Ok(profile) => {
                        profiles.insert(name, Arc::new(profile));
                    }
                    Err(e) => warn!("files: skipping profile {}: {}", name, e),
                }
            }
        }
        Ok(profiles)
    }

    async fn check(&self) -> Result<()> {
        fs::create_dir_all(self.tftp_root.join("pxelinux.cfg")).await.map_err(|e| {
            LabError::backend(
                FILES,
                format!("tftp root {} is unusable: {}", self.tftp_root.display(), e),
            )
        })?;
        self.items().await.map(|_| ())
    }
}

#[async_trait]
impl ProfileOrigin for PxeProfiles {
    #[tracing::instrument(skip(self, files))]
    async fn create_profile(&self, name: &str, files: &ProfileFiles) -> Result<()> {
        check_profile_name(name)?;
        let root = self
            .dirs
            .first()
            .ok_or_else(|| LabError::backend(FILES, "no profile directory configured"))?;
        let dir = root.join(name);
        if fs::metadata(&dir).await.is_ok() {
            return Err(LabError::InvalidRequest(format!("profile '{name}' exists")));
        }
        fs::create_dir_all(&dir).await?;
        for role in PROFILE_FILES {
            let source = profile_file(files, role)?;
            if let Err(e) = fs::copy(source, dir.join(role)).await {
                error!("files: copying {} failed, removing {}", role, dir.display());
                fs::remove_dir_all(&dir).await?;
                return Err(e.into());
            }
        }
        info!("files: created profile {}", name);
        Ok(())
    }
}
