//! Hosts on a libvirt hypervisor, driven through `virsh`.
//!
//! Two host origins exist: [`ExistingDomains`] lists domains defined outside
//! of testbay and treats them like physical machines, [`CreatedDomains`]
//! offers a template host that turns into a fresh domain per job. Created
//! domains are named `<domain_prefix><cookie>` and keep their disk image in
//! the job's session directory.
//!
//! [`KernelBootProfiles`] boot libvirt domains straight into a kernel and
//! initrd by rewriting the `<os>` element of their definition, without any
//! PXE infrastructure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use super::{path_list, LIBVIRT};
use crate::error::{LabError, Result};
use crate::host::{normalize_mac, Host};
use crate::inventory::{check_profile_name, profile_file, Origin, ProfileFiles, ProfileOrigin, PROFILE_FILES};
use crate::log::*;
use crate::process;
use crate::profile::{render_kargs, KargsCache, Profile};

/// Name of the template host offered by [`CreatedDomains`].
pub const CREATED_HOST: &str = "new-vm";

const DISK_IMAGE: &str = "disk.img";
const DOMAIN_XML: &str = "domain.xml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub connection_uri: String,
    pub network: String,
    pub domain_prefix: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub timeout_secs: u64,
    pub virsh: String,
    /// Directories holding kernel boot profiles, one subdirectory each.
    #[serde(deserialize_with = "path_list")]
    pub profiles: Vec<PathBuf>,
    /// Where boot settings and rewritten definitions of domains are kept.
    pub staging_path: PathBuf,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            connection_uri: "qemu:///system".into(),
            network: "default".into(),
            domain_prefix: "testbay-vm-".into(),
            vcpus: 2,
            memory_mib: 1024,
            disk_gib: 8,
            timeout_secs: process::DEFAULT_TIMEOUT.as_secs(),
            virsh: "virsh".into(),
            profiles: vec![],
            staging_path: PathBuf::from("/var/lib/testbay/libvirt"),
        }
    }
}

/// `virsh` bound to one connection.
#[derive(Debug, Clone)]
pub struct Virsh {
    program: String,
    connection_uri: String,
    timeout: Duration,
}

impl Virsh {
    pub fn new(config: &LibvirtConfig) -> Self {
        Self {
            program: config.virsh.clone(),
            connection_uri: config.connection_uri.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["--connect", self.connection_uri.as_str()];
        full.extend_from_slice(args);
        let out = process::run(
            LIBVIRT,
            &self.program,
            full,
            std::iter::empty::<(&str, &str)>(),
            self.timeout,
        )
        .await?;
        Ok(out.stdout)
    }

    /// Fail early if `virsh` isn't installed or the hypervisor is unreachable.
    pub async fn check(&self) -> Result<()> {
        which::which(&self.program).map_err(|e| {
            LabError::backend(LIBVIRT, format!("can't find '{}': {}", self.program, e))
        })?;
        self.run(&["version"]).await.map(|_| ())
    }

    async fn domains(&self) -> Result<Vec<String>> {
        Ok(parse_domain_list(&self.run(&["list", "--all", "--name"]).await?))
    }

    async fn first_mac(&self, domain: &str) -> Result<Option<String>> {
        Ok(parse_domiflist(&self.run(&["domiflist", domain]).await?))
    }

    async fn is_running(&self, domain: &str) -> Result<bool> {
        Ok(self.run(&["domstate", domain]).await?.trim() == "running")
    }

    async fn definition(&self, domain: &str) -> Result<String> {
        self.run(&["dumpxml", "--inactive", domain]).await
    }

    async fn define(&self, path: &Path) -> Result<()> {
        let path = path.display().to_string();
        self.run(&["define", path.as_str()]).await.map(|_| ())
    }
}

fn parse_domain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// The MAC address of the first interface in `virsh domiflist` output.
fn parse_domiflist(output: &str) -> Option<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with('-'))
        .skip(1)
        .filter_map(|line| line.split_whitespace().last())
        .find_map(normalize_mac)
}

/// A domain defined outside of testbay. It is never undefined, so it is
/// handled like a physical machine.
#[derive(Debug)]
pub struct ExistingDomain {
    name: String,
    mac: Option<String>,
    virsh: Virsh,
}

#[async_trait]
impl Host for ExistingDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        LIBVIRT
    }

    fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    fn domain(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn for_job(self: Arc<Self>, _cookie: &str, _session_dir: &Path) -> Arc<dyn Host> {
        self
    }

    async fn boot(&self) -> Result<()> {
        self.virsh.run(&["start", self.name.as_str()]).await.map(|_| ())
    }

    async fn reboot(&self) -> Result<()> {
        if self.virsh.is_running(&self.name).await? {
            self.virsh.run(&["reset", self.name.as_str()]).await.map(|_| ())
        } else {
            self.boot().await
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.virsh.run(&["destroy", self.name.as_str()]).await.map(|_| ())
    }
}

#[derive(Debug)]
pub struct ExistingDomains {
    virsh: Virsh,
    domain_prefix: String,
}

impl ExistingDomains {
    pub fn new(config: &LibvirtConfig) -> Self {
        Self {
            virsh: Virsh::new(config),
            domain_prefix: config.domain_prefix.clone(),
        }
    }
}

#[async_trait]
impl Origin<dyn Host> for ExistingDomains {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Host>>> {
        // Domains created for jobs are not hosts in their own right.
        let names: Vec<String> = self
            .virsh
            .domains()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with(&self.domain_prefix))
            .collect();
        let macs = join_all(names.iter().map(|name| self.virsh.first_mac(name))).await;
        let mut hosts: BTreeMap<String, Arc<dyn Host>> = BTreeMap::new();
        for (name, mac) in names.into_iter().zip(macs) {
            let mac = mac.unwrap_or_else(|e| {
                warn!("libvirt: no MAC address for {}: {}", name, e);
                None
            });
            hosts.insert(
                name.clone(),
                Arc::new(ExistingDomain {
                    name,
                    mac,
                    virsh: self.virsh.clone(),
                }),
            );
        }
        Ok(hosts)
    }

    async fn check(&self) -> Result<()> {
        self.virsh.check().await?;
        self.items().await.map(|_| ())
    }
}

/// The template host. It can't be powered itself; jobs get a
/// [`CreatedDomain`] from [`Host::for_job`].
#[derive(Debug)]
pub struct DomainTemplate {
    config: LibvirtConfig,
    virsh: Virsh,
}

impl DomainTemplate {
    fn unusable(&self) -> LabError {
        LabError::InvalidRequest(format!(
            "{CREATED_HOST} is a template, it only exists as part of a job"
        ))
    }
}

#[async_trait]
impl Host for DomainTemplate {
    fn name(&self) -> &str {
        CREATED_HOST
    }

    fn backend(&self) -> &str {
        LIBVIRT
    }

    fn mac(&self) -> Option<&str> {
        None
    }

    fn is_virtual(&self) -> bool {
        true
    }

    fn for_job(self: Arc<Self>, cookie: &str, session_dir: &Path) -> Arc<dyn Host> {
        Arc::new(CreatedDomain {
            domain: format!("{}{}", self.config.domain_prefix, cookie),
            mac: mac_for(cookie),
            dir: session_dir.to_path_buf(),
            config: self.config.clone(),
            virsh: self.virsh.clone(),
        })
    }

    async fn boot(&self) -> Result<()> {
        Err(self.unusable())
    }

    async fn reboot(&self) -> Result<()> {
        Err(self.unusable())
    }

    async fn shutdown(&self) -> Result<()> {
        Err(self.unusable())
    }
}

/// A locally administered unicast MAC address derived from the job's
/// cookie, so the same job maps to the same address after a restart.
///
/// The first octet is fixed at `0x52`; the other 40 bits come from the
/// FNV-1a hash of the cookie.
fn mac_for(cookie: &str) -> String {
    let hash = cookie
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
    let octets = hash.to_be_bytes();
    format!(
        "52:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[3], octets[4], octets[5], octets[6], octets[7]
    )
}

/// A domain created for exactly one job.
#[derive(Debug)]
pub struct CreatedDomain {
    domain: String,
    mac: String,
    dir: PathBuf,
    config: LibvirtConfig,
    virsh: Virsh,
}

impl CreatedDomain {
    fn disk(&self) -> PathBuf {
        self.dir.join(DISK_IMAGE)
    }

    fn definition(&self) -> String {
        format!(
            r#"<domain type="kvm">
  <name>{name}</name>
  <memory unit="MiB">{memory}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type>hvm</type>
    <boot dev="network"/>
    <boot dev="hd"/>
  </os>
  <features><acpi/><apic/></features>
  <on_reboot>restart</on_reboot>
  <devices>
    <disk type="file" device="disk">
      <driver name="qemu" type="raw"/>
      <source file="{disk}"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <interface type="network">
      <mac address="{mac}"/>
      <source network="{network}"/>
      <model type="virtio"/>
    </interface>
    <serial type="pty"/>
    <console type="pty"/>
  </devices>
</domain>
"#,
            name = self.domain,
            memory = self.config.memory_mib,
            vcpus = self.config.vcpus,
            disk = self.disk().display(),
            mac = self.mac,
            network = self.config.network,
        )
    }
}

#[async_trait]
impl Host for CreatedDomain {
    fn name(&self) -> &str {
        CREATED_HOST
    }

    fn backend(&self) -> &str {
        LIBVIRT
    }

    fn mac(&self) -> Option<&str> {
        Some(self.mac.as_str())
    }

    fn domain(&self) -> Option<&str> {
        Some(&self.domain)
    }

    fn is_virtual(&self) -> bool {
        true
    }

    fn for_job(self: Arc<Self>, _cookie: &str, _session_dir: &Path) -> Arc<dyn Host> {
        self
    }

    #[tracing::instrument(skip(self), fields(domain = %self.domain))]
    async fn create_images(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let disk = fs::File::create(self.disk()).await?;
        disk.set_len(self.config.disk_gib * 1024 * 1024 * 1024).await?;
        debug!("libvirt: created {} GiB image for {}", self.config.disk_gib, self.domain);
        Ok(())
    }

    async fn remove_images(&self) -> Result<()> {
        match fs::remove_file(self.disk()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self), fields(domain = %self.domain))]
    async fn define(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(DOMAIN_XML);
        fs::write(&path, self.definition()).await?;
        self.virsh.define(&path).await?;
        info!("libvirt: defined {}", self.domain);
        Ok(())
    }

    async fn undefine(&self) -> Result<()> {
        self.virsh.run(&["undefine", self.domain.as_str()]).await.map(|_| ())
    }

    async fn boot(&self) -> Result<()> {
        self.virsh.run(&["start", self.domain.as_str()]).await.map(|_| ())
    }

    async fn reboot(&self) -> Result<()> {
        self.virsh.run(&["reboot", self.domain.as_str()]).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        self.virsh.run(&["destroy", self.domain.as_str()]).await.map(|_| ())
    }

    fn describe(&self) -> Value {
        serde_json::json!({
            "name": CREATED_HOST,
            "backend": LIBVIRT,
            "mac": self.mac,
            "virtual": true,
            "domain": self.domain,
        })
    }
}

#[derive(Debug)]
pub struct CreatedDomains {
    template: Arc<DomainTemplate>,
}

impl CreatedDomains {
    pub fn new(config: &LibvirtConfig) -> Self {
        Self {
            template: Arc::new(DomainTemplate {
                config: config.clone(),
                virsh: Virsh::new(config),
            }),
        }
    }
}

#[async_trait]
impl Origin<dyn Host> for CreatedDomains {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Host>>> {
        let mut hosts: BTreeMap<String, Arc<dyn Host>> = BTreeMap::new();
        hosts.insert(CREATED_HOST.to_string(), self.template.clone());
        Ok(hosts)
    }

    async fn check(&self) -> Result<()> {
        self.template.virsh.check().await
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// What a domain boots into, staged by `assign_to` until PXE is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KernelBoot {
    kernel: PathBuf,
    initrd: PathBuf,
    cmdline: String,
}

/// `definition` without its direct kernel boot elements.
fn strip_kernel_boot(definition: &str) -> Result<String> {
    let elements = Regex::new(
        r"(?s)\s*<(?:kernel|initrd|cmdline)\s*/>|\s*<(?:kernel|initrd|cmdline)>.*?</(?:kernel|initrd|cmdline)>",
    )
    .map_err(|e| LabError::backend(LIBVIRT, e))?;
    Ok(elements.replace_all(definition, "").into_owned())
}

/// `definition` booting straight into `boot`.
fn with_kernel_boot(definition: &str, boot: &KernelBoot) -> Result<String> {
    let mut definition = strip_kernel_boot(definition)?;
    let end = definition
        .find("</os>")
        .ok_or_else(|| LabError::backend(LIBVIRT, "domain definition has no <os> element"))?;
    definition.insert_str(
        end,
        &format!(
            "  <kernel>{}</kernel>\n    <initrd>{}</initrd>\n    <cmdline>{}</cmdline>\n  ",
            xml_escape(&boot.kernel.display().to_string()),
            xml_escape(&boot.initrd.display().to_string()),
            xml_escape(&boot.cmdline),
        ),
    );
    Ok(definition)
}

/// A kernel, initrd and kargs booted directly by libvirt domains.
#[derive(Debug)]
pub struct KernelBootProfile {
    name: String,
    dir: PathBuf,
    base_kargs: String,
    staging: PathBuf,
    virsh: Virsh,
    cache: Arc<KargsCache>,
}

fn domain_of(host: &dyn Host) -> Result<&str> {
    host.domain().ok_or_else(|| {
        LabError::InvalidRequest(format!(
            "{} is not a libvirt domain, it can't boot a kernel directly",
            host.name()
        ))
    })
}

impl KernelBootProfile {
    fn staged(&self, domain: &str) -> PathBuf {
        self.staging.join(format!("{domain}.boot"))
    }

    fn rewritten(&self, domain: &str) -> PathBuf {
        self.staging.join(format!("{domain}.xml"))
    }

    /// Redefine `domain` from `update(current definition)`, unless nothing
    /// changes.
    async fn redefine(&self, domain: &str, update: impl FnOnce(&str) -> Result<String>) -> Result<()> {
        let current = self.virsh.definition(domain).await?;
        let updated = update(&current)?;
        if updated == current {
            debug!("libvirt: {} needs no redefinition", domain);
            return Ok(());
        }
        fs::create_dir_all(&self.staging).await?;
        let path = self.rewritten(domain);
        fs::write(&path, updated).await?;
        self.virsh.define(&path).await
    }
}

#[async_trait]
impl Profile for KernelBootProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        LIBVIRT
    }

    fn kargs(&self, additional: &str) -> String {
        self.cache.join(&self.base_kargs, additional)
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn assign_to(&self, host: &dyn Host, cookie: &str, additional_kargs: &str) -> Result<()> {
        let domain = domain_of(host)?;
        let boot = KernelBoot {
            kernel: self.dir.join("kernel"),
            initrd: self.dir.join("initrd"),
            cmdline: render_kargs(&self.kargs(additional_kargs), cookie),
        };
        fs::create_dir_all(&self.staging).await?;
        fs::write(self.staged(domain), serde_json::to_vec(&boot)?).await?;
        debug!("libvirt: staged kernel boot of {} for {}", self.name, domain);
        Ok(())
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn revoke_from(&self, host: &dyn Host) -> Result<()> {
        let domain = domain_of(host)?;
        self.redefine(domain, strip_kernel_boot).await?;
        for path in [self.staged(domain), self.rewritten(domain)] {
            match fs::remove_file(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn enable_pxe(&self, host: &dyn Host, enable: bool) -> Result<()> {
        let domain = domain_of(host)?;
        if !enable {
            return self.redefine(domain, strip_kernel_boot).await;
        }
        let staged = fs::read(self.staged(domain)).await.map_err(|_| {
            LabError::InvalidRequest(format!(
                "profile {} was never assigned to {}",
                self.name,
                host.name()
            ))
        })?;
        let boot: KernelBoot = serde_json::from_slice(&staged)?;
        self.redefine(domain, |current| with_kernel_boot(current, &boot))
            .await?;
        info!("libvirt: {} boots {} directly", domain, self.name);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!("libvirt: removing profile {}", self.dir.display());
        fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }
}

/// Profile directories with `kernel`, `initrd` and `kargs` files, booted
/// directly by domains.
#[derive(Debug)]
pub struct KernelBootProfiles {
    dirs: Vec<PathBuf>,
    staging: PathBuf,
    virsh: Virsh,
    cache: Arc<KargsCache>,
}

impl KernelBootProfiles {
    pub fn new(config: &LibvirtConfig) -> Self {
        Self {
            dirs: config.profiles.clone(),
            staging: config.staging_path.clone(),
            virsh: Virsh::new(config),
            cache: Arc::new(KargsCache::new()),
        }
    }

    async fn read_profile(&self, name: &str, dir: &Path) -> Result<KernelBootProfile> {
        for file in PROFILE_FILES {
            if fs::metadata(dir.join(file)).await.is_err() {
                return Err(LabError::backend(
                    LIBVIRT,
                    format!("profile {name} lacks its {file} file"),
                ));
            }
        }
        let base_kargs = fs::read_to_string(dir.join("kargs")).await?;
        Ok(KernelBootProfile {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            base_kargs: base_kargs.trim().to_string(),
            staging: self.staging.clone(),
            virsh: self.virsh.clone(),
            cache: self.cache.clone(),
        })
    }
}

#[async_trait]
impl Origin<dyn Profile> for KernelBootProfiles {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Profile>>> {
        let mut profiles: BTreeMap<String, Arc<dyn Profile>> = BTreeMap::new();
        for dir in &self.dirs {
            let mut entries = fs::read_dir(dir).await.map_err(|e| {
                LabError::backend(LIBVIRT, format!("can't read {}: {}", dir.display(), e))
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
                    Err(e) => warn!("libvirt: skipping profile {}: {}", name, e),
                }
            }
        }
        Ok(profiles)
    }

    async fn check(&self) -> Result<()> {
        self.virsh.check().await?;
        fs::create_dir_all(&self.staging).await.map_err(|e| {
            LabError::backend(
                LIBVIRT,
                format!("staging path {} is unusable: {}", self.staging.display(), e),
            )
        })?;
        self.items().await.map(|_| ())
    }
}

#[async_trait]
impl ProfileOrigin for KernelBootProfiles {
    #[tracing::instrument(skip(self, files))]
    async fn create_profile(&self, name: &str, files: &ProfileFiles) -> Result<()> {
        check_profile_name(name)?;
        let root = self
            .dirs
            .first()
            .ok_or_else(|| LabError::backend(LIBVIRT, "no profile directory configured"))?;
        let dir = root.join(name);
        if fs::metadata(&dir).await.is_ok() {
            return Err(LabError::InvalidRequest(format!("profile '{name}' exists")));
        }
        fs::create_dir_all(&dir).await?;
        for role in PROFILE_FILES {
            let copied = match profile_file(files, role) {
                Ok(source) => fs::copy(source, dir.join(role)).await.map_err(LabError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = copied {
                error!("libvirt: creating profile {} failed, removing {}", name, dir.display());
                fs::remove_dir_all(&dir).await?;
                return Err(e);
            }
        }
        info!("libvirt: created profile {}", name);
        Ok(())
    }
}
