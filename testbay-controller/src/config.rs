use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use testbay::backends::cobbler::{CobblerClient, CobblerConfig, CobblerProfiles, CobblerSystems};
use testbay::backends::files::{
    FilesConfig, HostFiles, PxeProfiles, TestplanFiles, TestsuiteFiles,
};
use testbay::backends::libvirt::{CreatedDomains, ExistingDomains, KernelBootProfiles, LibvirtConfig};
use testbay::backends::{COBBLER, FILES, KNOWN_BACKENDS, LIBVIRT};
use testbay::inventory::Inventory;
use testbay::log::*;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub enabled: Vec<String>,
    /// Backend receiving uploaded profiles.
    pub primary_profile: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            enabled: vec![FILES.into()],
            primary_profile: FILES.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub session_path: PathBuf,
    pub hooks_path: Option<PathBuf>,
    pub bootstrap_template: Option<PathBuf>,
    pub backends: BackendsConfig,
    pub files: FilesConfig,
    pub cobbler: CobblerConfig,
    pub libvirt: LibvirtConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            session_path: PathBuf::from("/var/lib/testbay/sessions"),
            hooks_path: None,
            bootstrap_template: None,
            backends: BackendsConfig::default(),
            files: FilesConfig::default(),
            cobbler: CobblerConfig::default(),
            libvirt: LibvirtConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml).wrap_err("malformed configuration")?;
        config.validate()?;
        Ok(config)
    }

    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("can't read {}", path.display()))?;
        let config = Self::from_yaml(&yaml)?;
        debug!("config: loaded {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(unknown) = self
            .backends
            .enabled
            .iter()
            .find(|b| !KNOWN_BACKENDS.contains(&b.as_str()))
        {
            return Err(eyre!("unknown backend '{}' enabled", unknown));
        }
        if !self.backends.enabled.contains(&self.backends.primary_profile) {
            return Err(eyre!(
                "primary profile backend '{}' is not enabled",
                self.backends.primary_profile
            ));
        }
        if self.backends.primary_profile == LIBVIRT && self.libvirt.profiles.is_empty() {
            return Err(eyre!("a libvirt primary profile backend needs libvirt.profiles"));
        }
        if self.backends.primary_profile == COBBLER && self.cobbler.ssh_uri.is_none() {
            warn!("config: cobbler.ssh_uri is not set, profile uploads will be refused");
        }
        if self.cobbler.ssh_uri.is_some() && self.cobbler.ssh_key.is_none() {
            return Err(eyre!("cobbler.ssh_uri needs cobbler.ssh_key"));
        }
        if self.backends.enabled.iter().any(|b| b == FILES)
            && !self.files.profiles.is_empty()
            && self.files.tftp_root.is_none()
        {
            return Err(eyre!("files.profiles needs files.tftp_root"));
        }
        Ok(())
    }

    /// Assemble the inventory from every enabled backend, in the order they
    /// are enabled.
    pub fn inventory(&self) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        for backend in &self.backends.enabled {
            inventory = match backend.as_str() {
                FILES => {
                    let files = &self.files;
                    let inventory = inventory
                        .with_plans(FILES, Arc::new(TestplanFiles::new(files.testplans.clone())))
                        .with_testsuites(FILES, Arc::new(TestsuiteFiles::new(files.testsuites.clone())))
                        .with_hosts(FILES, Arc::new(HostFiles::new(files.hosts.clone())));
                    match &files.tftp_root {
                        Some(tftp_root) => inventory.with_profiles(
                            FILES,
                            Arc::new(PxeProfiles::new(files.profiles.clone(), tftp_root.clone())),
                        ),
                        None => inventory,
                    }
                }
                LIBVIRT => {
                    let inventory = inventory
                        .with_hosts(LIBVIRT, Arc::new(ExistingDomains::new(&self.libvirt)))
                        .with_hosts(LIBVIRT, Arc::new(CreatedDomains::new(&self.libvirt)));
                    if self.libvirt.profiles.is_empty() {
                        inventory
                    } else {
                        inventory.with_profiles(LIBVIRT, Arc::new(KernelBootProfiles::new(&self.libvirt)))
                    }
                }
                COBBLER => {
                    let client = Arc::new(CobblerClient::new(&self.cobbler)?);
                    let systems = CobblerSystems::new(
                        client.clone(),
                        &self.cobbler.identification_expression,
                        self.cobbler.whitelist.clone(),
                    )?;
                    let mut profiles = CobblerProfiles::new(client);
                    if let Some(remote) = self.cobbler.remote()? {
                        profiles = profiles.with_uploads(remote, &self.cobbler);
                    }
                    inventory
                        .with_hosts(COBBLER, Arc::new(systems))
                        .with_profiles(COBBLER, Arc::new(profiles))
                }
                other => return Err(eyre!("unknown backend '{}'", other)),
            };
            info!("config: enabled backend {}", backend);
        }
        Ok(inventory)
    }
}
