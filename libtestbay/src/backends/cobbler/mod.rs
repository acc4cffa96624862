//! Systems and profiles of a Cobbler provisioning server.
//!
//! Cobbler systems whose names match the identification expression (or are
//! whitelisted) become hosts. Cobbler profiles can be assigned to any host
//! with a MAC address: hosts that aren't Cobbler systems get a transient
//! system which is removed again when the profile is revoked.
//!
//! New profiles are created by uploading their kernel and initrd to the
//! Cobbler host over ssh and registering a distro and a profile of the same
//! name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use self::ssh::{RemoteFiles, SshRemote};
use self::xmlrpc::Value;
use super::COBBLER;
use crate::error::{LabError, Result};
use crate::host::{normalize_mac, Host};
use crate::inventory::{check_profile_name, profile_file, Origin, ProfileFiles, ProfileOrigin};
use crate::log::*;
use crate::process;
use crate::profile::{render_kargs, KargsCache, Profile};

pub mod ssh;
pub mod xmlrpc;

/// Comment marking systems created for hosts of other backends.
const TRANSIENT_COMMENT: &str = "testbay transient system";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CobblerConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub identification_expression: String,
    pub whitelist: Vec<String>,
    pub timeout_secs: u64,
    /// `[user@]host[:port]` of the Cobbler host; profiles can only be
    /// created when set.
    pub ssh_uri: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub ssh_key_passphrase: Option<String>,
    /// SHA256 fingerprint the Cobbler host's key must have.
    pub ssh_host_fingerprint: Option<String>,
    /// Directory on the Cobbler host receiving uploaded images.
    pub remote_path_prefix: String,
    pub arch: String,
    pub breed: String,
}

impl Default for CobblerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost/cobbler_api".into(),
            username: "cobbler".into(),
            password: "cobbler".into(),
            identification_expression: "^testbay-".into(),
            whitelist: vec![],
            timeout_secs: process::DEFAULT_TIMEOUT.as_secs(),
            ssh_uri: None,
            ssh_key: None,
            ssh_key_passphrase: None,
            ssh_host_fingerprint: None,
            remote_path_prefix: "/var/lib/testbay/images".into(),
            arch: "x86_64".into(),
            breed: "generic".into(),
        }
    }
}

impl CobblerConfig {
    /// The uploader for new profiles, if ssh is configured.
    pub fn remote(&self) -> Result<Option<Arc<dyn RemoteFiles>>> {
        let Some(uri) = &self.ssh_uri else {
            return Ok(None);
        };
        let key = self.ssh_key.clone().ok_or_else(|| {
            LabError::InvalidRequest("cobbler.ssh_uri needs cobbler.ssh_key".into())
        })?;
        let remote: Arc<dyn RemoteFiles> = Arc::new(SshRemote::new(
            uri,
            key,
            self.ssh_key_passphrase.clone(),
            self.ssh_host_fingerprint.clone(),
            Duration::from_secs(self.timeout_secs),
        )?);
        Ok(Some(remote))
    }
}

/// A thin XML-RPC client. Every operation logs in anew, tokens are never
/// kept around.
#[derive(Debug)]
pub struct CobblerClient {
    url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl CobblerClient {
    pub fn new(config: &CobblerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LabError::backend(COBBLER, e))?;
        Ok(Self {
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            http,
        })
    }

    #[tracing::instrument(skip(self, params))]
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(xmlrpc::encode_call(method, params))
            .send()
            .await
            .map_err(|e| LabError::backend(COBBLER, format!("{method}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LabError::backend(COBBLER, format!("{method}: {e}")))?;
        if !status.is_success() {
            return Err(LabError::backend(COBBLER, format!("{method}: HTTP {status}")));
        }
        xmlrpc::decode_response(COBBLER, &body)
    }

    pub async fn login(&self) -> Result<String> {
        let token = self
            .call(
                "login",
                &[self.username.as_str().into(), self.password.as_str().into()],
            )
            .await?;
        token
            .as_str()
            .map(String::from)
            .ok_or_else(|| LabError::backend(COBBLER, "login returned no token"))
    }

    async fn list(&self, method: &str) -> Result<Vec<Value>> {
        let listed = self.call(method, &[]).await?;
        listed
            .as_array()
            .map(<[Value]>::to_vec)
            .ok_or_else(|| LabError::backend(COBBLER, format!("{method} returned no list")))
    }

    pub async fn systems(&self) -> Result<Vec<Value>> {
        self.list("get_systems").await
    }

    pub async fn profiles(&self) -> Result<Vec<Value>> {
        self.list("get_profiles").await
    }

    pub async fn system_exists(&self, name: &str) -> Result<bool> {
        let mut criteria = BTreeMap::new();
        criteria.insert("name".to_string(), Value::from(name));
        let found = self.call("find_system", &[Value::Struct(criteria)]).await?;
        Ok(found.as_array().map_or(false, |names| !names.is_empty()))
    }

    pub async fn system_handle(&self, name: &str, token: &str) -> Result<String> {
        let handle = self
            .call("get_system_handle", &[name.into(), token.into()])
            .await?;
        handle
            .as_str()
            .map(String::from)
            .ok_or_else(|| LabError::backend(COBBLER, format!("no handle for system {name}")))
    }

    /// `new_<kind>`: a handle for a new, unsaved object.
    pub async fn new_item(&self, kind: &str, token: &str) -> Result<String> {
        let method = format!("new_{kind}");
        let handle = self.call(&method, &[token.into()]).await?;
        handle
            .as_str()
            .map(String::from)
            .ok_or_else(|| LabError::backend(COBBLER, format!("{method} returned no handle")))
    }

    pub async fn modify_item(&self, kind: &str, handle: &str, field: &str, value: Value, token: &str) -> Result<()> {
        self.call(
            &format!("modify_{kind}"),
            &[handle.into(), field.into(), value, token.into()],
        )
        .await
        .map(|_| ())
    }

    pub async fn save_item(&self, kind: &str, handle: &str, token: &str) -> Result<()> {
        self.call(&format!("save_{kind}"), &[handle.into(), token.into()])
            .await
            .map(|_| ())
    }

    pub async fn remove_item(&self, kind: &str, name: &str, token: &str) -> Result<()> {
        self.call(&format!("remove_{kind}"), &[name.into(), token.into()])
            .await
            .map(|_| ())
    }

    pub async fn new_system(&self, token: &str) -> Result<String> {
        self.new_item("system", token).await
    }

    pub async fn modify_system(&self, handle: &str, field: &str, value: Value, token: &str) -> Result<()> {
        self.modify_item("system", handle, field, value, token).await
    }

    pub async fn save_system(&self, handle: &str, token: &str) -> Result<()> {
        self.save_item("system", handle, token).await
    }

    pub async fn remove_system(&self, name: &str, token: &str) -> Result<()> {
        self.remove_item("system", name, token).await
    }

    /// `power` is one of `on`, `off` or `reboot`.
    pub async fn power_system(&self, handle: &str, power: &str, token: &str) -> Result<()> {
        self.call("power_system", &[handle.into(), power.into(), token.into()])
            .await
            .map(|_| ())
    }

    pub async fn remove_profile(&self, name: &str, token: &str) -> Result<()> {
        self.remove_item("profile", name, token).await
    }

    pub async fn remove_distro(&self, name: &str, token: &str) -> Result<()> {
        self.remove_item("distro", name, token).await
    }

    pub async fn sync(&self, token: &str) -> Result<()> {
        self.call("sync", &[token.into()]).await.map(|_| ())
    }
}

/// The MAC of the first interface which has one.
fn system_mac(system: &Value) -> Option<String> {
    system
        .get("interfaces")?
        .as_struct()?
        .values()
        .filter_map(|interface| interface.get("mac_address")?.as_str())
        .find_map(normalize_mac)
}

/// Cobbler reports kernel options either as a string or as a struct.
fn kernel_options(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(options)) => options.trim().to_string(),
        Some(Value::Struct(options)) => options
            .iter()
            .map(|(key, value)| match value.as_str() {
                Some("") | Some("~") | None => key.clone(),
                Some(value) => format!("{key}={value}"),
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

#[derive(Debug)]
pub struct CobblerSystem {
    name: String,
    mac: Option<String>,
    client: Arc<CobblerClient>,
}

impl CobblerSystem {
    async fn power(&self, power: &str) -> Result<()> {
        let token = self.client.login().await?;
        let handle = self.client.system_handle(&self.name, &token).await?;
        debug!("cobbler: power {} {}", power, self.name);
        self.client.power_system(&handle, power, &token).await
    }
}

#[async_trait]
impl Host for CobblerSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        COBBLER
    }

    fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    fn for_job(self: Arc<Self>, _cookie: &str, _session_dir: &Path) -> Arc<dyn Host> {
        self
    }

    async fn boot(&self) -> Result<()> {
        self.power("on").await
    }

    async fn reboot(&self) -> Result<()> {
        self.power("reboot").await
    }

    async fn shutdown(&self) -> Result<()> {
        self.power("off").await
    }
}

#[derive(Debug)]
pub struct CobblerSystems {
    client: Arc<CobblerClient>,
    expression: Regex,
    whitelist: Vec<String>,
}

impl CobblerSystems {
    pub fn new(client: Arc<CobblerClient>, expression: &str, whitelist: Vec<String>) -> Result<Self> {
        let expression = Regex::new(expression).map_err(|e| {
            LabError::InvalidRequest(format!("bad cobbler identification expression: {e}"))
        })?;
        Ok(Self {
            client,
            expression,
            whitelist,
        })
    }

    fn is_lab_system(&self, name: &str) -> bool {
        self.expression.is_match(name) || self.whitelist.iter().any(|w| w == name)
    }
}

#[async_trait]
impl Origin<dyn Host> for CobblerSystems {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Host>>> {
        let mut hosts: BTreeMap<String, Arc<dyn Host>> = BTreeMap::new();
        for system in self.client.systems().await? {
            let Some(name) = system.get("name").and_then(Value::as_str) else {
                continue;
            };
            let transient = system.get("comment").and_then(Value::as_str) == Some(TRANSIENT_COMMENT);
            if transient || !self.is_lab_system(name) {
                continue;
            }
            hosts.insert(
                name.to_string(),
                Arc::new(CobblerSystem {
                    name: name.to_string(),
                    mac: system_mac(&system),
                    client: self.client.clone(),
                }),
            );
        }
        Ok(hosts)
    }

    async fn check(&self) -> Result<()> {
        self.client.login().await?;
        let hosts = self.items().await?;
        info!("cobbler: {} systems available", hosts.len());
        Ok(())
    }
}

/// Where an uploaded profile image lives on the Cobbler host.
fn remote_path(prefix: &str, profile: &str, role: &str) -> String {
    format!("{}/testbay-{}-{}", prefix.trim_end_matches('/'), profile, role)
}

/// Uploads and the remote prefix they go to.
#[derive(Debug, Clone)]
struct Uploads {
    remote: Arc<dyn RemoteFiles>,
    prefix: String,
}

impl Uploads {
    async fn remove(&self, profile: &str) {
        for role in ["kernel", "initrd"] {
            let path = remote_path(&self.prefix, profile, role);
            if let Err(e) = self.remote.remove(&path).await {
                warn!("cobbler: can't remove {}: {}", path, e);
            }
        }
    }
}

#[derive(Debug)]
pub struct CobblerProfile {
    name: String,
    base_kargs: String,
    /// The distro, when it was created together with the profile.
    own_distro: bool,
    client: Arc<CobblerClient>,
    uploads: Option<Uploads>,
    cache: Arc<KargsCache>,
}

/// The Cobbler system backing `host`. Hosts of other backends map to a
/// transient system named after their MAC, since templated hosts share one
/// name across jobs.
fn system_name(host: &dyn Host) -> Result<(String, Option<String>)> {
    if host.backend() == COBBLER {
        return Ok((host.name().to_string(), None));
    }
    let mac = host
        .mac()
        .and_then(normalize_mac)
        .ok_or_else(|| LabError::InvalidRequest(format!("host {} has no MAC address", host.name())))?;
    Ok((format!("testbay-transient-{}", mac.replace(':', "")), Some(mac)))
}

impl CobblerProfile {
    /// Handle of the system backing `host`, creating the transient system
    /// of a foreign host on first use.
    async fn system_for(&self, host: &dyn Host, token: &str) -> Result<String> {
        let (name, mac) = system_name(host)?;
        let Some(mac) = mac else {
            return self.client.system_handle(&name, token).await;
        };
        if self.client.system_exists(&name).await? {
            return self.client.system_handle(&name, token).await;
        }
        info!("cobbler: adding transient system {} for {}", name, host.name());
        let handle = self.client.new_system(token).await?;
        self.client
            .modify_system(&handle, "name", name.as_str().into(), token)
            .await?;
        self.client
            .modify_system(&handle, "comment", TRANSIENT_COMMENT.into(), token)
            .await?;
        let mut interface = BTreeMap::new();
        interface.insert("macaddress-eth0".to_string(), Value::from(mac));
        self.client
            .modify_system(&handle, "modify_interface", Value::Struct(interface), token)
            .await?;
        Ok(handle)
    }
}

#[async_trait]
impl Profile for CobblerProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        COBBLER
    }

    fn kargs(&self, additional: &str) -> String {
        self.cache.join(&self.base_kargs, additional)
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn assign_to(&self, host: &dyn Host, cookie: &str, additional_kargs: &str) -> Result<()> {
        let token = self.client.login().await?;
        let handle = self.system_for(host, &token).await?;
        let kargs = render_kargs(&self.kargs(additional_kargs), cookie);
        self.client
            .modify_system(&handle, "profile", self.name.as_str().into(), &token)
            .await?;
        self.client
            .modify_system(&handle, "kernel_options", kargs.into(), &token)
            .await?;
        self.client.save_system(&handle, &token).await?;
        self.client.sync(&token).await
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn revoke_from(&self, host: &dyn Host) -> Result<()> {
        let token = self.client.login().await?;
        let (name, mac) = system_name(host)?;
        if mac.is_some() {
            info!("cobbler: removing transient system {}", name);
            self.client.remove_system(&name, &token).await?;
            return self.client.sync(&token).await;
        }
        let handle = self.client.system_handle(&name, &token).await?;
        self.client
            .modify_system(&handle, "kernel_options", "".into(), &token)
            .await?;
        self.client
            .modify_system(&handle, "netboot_enabled", false.into(), &token)
            .await?;
        self.client.save_system(&handle, &token).await?;
        self.client.sync(&token).await
    }

    #[tracing::instrument(skip(self, host), fields(profile = %self.name, host = %host.name()))]
    async fn enable_pxe(&self, host: &dyn Host, enable: bool) -> Result<()> {
        let token = self.client.login().await?;
        let (name, mac) = system_name(host)?;
        if !enable && mac.is_some() && !self.client.system_exists(&name).await? {
            debug!("cobbler: {} has no transient system, nothing to disable", host.name());
            return Ok(());
        }
        let handle = self.system_for(host, &token).await?;
        self.client
            .modify_system(&handle, "netboot_enabled", enable.into(), &token)
            .await?;
        self.client.save_system(&handle, &token).await?;
        self.client.sync(&token).await
    }

    async fn delete(&self) -> Result<()> {
        let token = self.client.login().await?;
        info!("cobbler: removing profile {}", self.name);
        self.client.remove_profile(&self.name, &token).await?;
        if self.own_distro {
            self.client.remove_distro(&self.name, &token).await?;
            if let Some(uploads) = &self.uploads {
                uploads.remove(&self.name).await;
            }
        }
        self.client.sync(&token).await
    }
}

#[derive(Debug)]
pub struct CobblerProfiles {
    client: Arc<CobblerClient>,
    uploads: Option<Uploads>,
    arch: String,
    breed: String,
    cache: Arc<KargsCache>,
}

impl CobblerProfiles {
    pub fn new(client: Arc<CobblerClient>) -> Self {
        let defaults = CobblerConfig::default();
        Self {
            client,
            uploads: None,
            arch: defaults.arch,
            breed: defaults.breed,
            cache: Arc::new(KargsCache::new()),
        }
    }

    /// Allow creating profiles, uploading images through `remote`.
    pub fn with_uploads(mut self, remote: Arc<dyn RemoteFiles>, config: &CobblerConfig) -> Self {
        self.uploads = Some(Uploads {
            remote,
            prefix: config.remote_path_prefix.clone(),
        });
        self.arch = config.arch.clone();
        self.breed = config.breed.clone();
        self
    }

    /// Register the distro and profile `name` for images already uploaded.
    async fn register(&self, name: &str, kargs: &str, prefix: &str, token: &str) -> Result<()> {
        let distro = self.client.new_item("distro", token).await?;
        let fields = [
            ("name", name.to_string()),
            ("kernel", remote_path(prefix, name, "kernel")),
            ("initrd", remote_path(prefix, name, "initrd")),
            ("arch", self.arch.clone()),
            ("breed", self.breed.clone()),
        ];
        for (field, value) in fields {
            self.client
                .modify_item("distro", &distro, field, value.into(), token)
                .await?;
        }
        self.client.save_item("distro", &distro, token).await?;

        let profile = async {
            let handle = self.client.new_item("profile", token).await?;
            let fields = [("name", name), ("distro", name), ("kernel_options", kargs)];
            for (field, value) in fields {
                self.client
                    .modify_item("profile", &handle, field, value.into(), token)
                    .await?;
            }
            self.client.save_item("profile", &handle, token).await
        };
        if let Err(e) = profile.await {
            error!("cobbler: creating profile {} failed, removing its distro", name);
            if let Err(e) = self.client.remove_distro(name, token).await {
                warn!("cobbler: can't remove distro {}: {}", name, e);
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Origin<dyn Profile> for CobblerProfiles {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Profile>>> {
        let mut profiles: BTreeMap<String, Arc<dyn Profile>> = BTreeMap::new();
        for profile in self.client.profiles().await? {
            let Some(name) = profile.get("name").and_then(Value::as_str) else {
                continue;
            };
            let distro = profile.get("distro").and_then(Value::as_str);
            profiles.insert(
                name.to_string(),
                Arc::new(CobblerProfile {
                    name: name.to_string(),
                    base_kargs: kernel_options(profile.get("kernel_options")),
                    own_distro: distro == Some(name),
                    client: self.client.clone(),
                    uploads: self.uploads.clone(),
                    cache: self.cache.clone(),
                }),
            );
        }
        Ok(profiles)
    }

    async fn check(&self) -> Result<()> {
        self.client.login().await?;
        if let Some(uploads) = &self.uploads {
            uploads.remote.check().await?;
        }
        self.items().await.map(|_| ())
    }
}

#[async_trait]
impl ProfileOrigin for CobblerProfiles {
    #[tracing::instrument(skip(self, files))]
    async fn create_profile(&self, name: &str, files: &ProfileFiles) -> Result<()> {
        let uploads = self.uploads.as_ref().ok_or_else(|| {
            LabError::InvalidRequest(format!(
                "can't create profile '{name}': cobbler.ssh_uri is not configured"
            ))
        })?;
        check_profile_name(name)?;
        if name.contains(char::is_whitespace) {
            return Err(LabError::InvalidRequest(format!("bad profile name '{name}'")));
        }
        let kernel = profile_file(files, "kernel")?;
        let initrd = profile_file(files, "initrd")?;
        let kargs = tokio::fs::read_to_string(profile_file(files, "kargs")?).await?;

        let token = self.client.login().await?;
        let exists = self
            .client
            .profiles()
            .await?
            .iter()
            .any(|profile| profile.get("name").and_then(Value::as_str) == Some(name));
        if exists {
            return Err(LabError::InvalidRequest(format!("profile '{name}' exists")));
        }

        let uploaded = async {
            for (role, local) in [("kernel", kernel), ("initrd", initrd)] {
                let remote = remote_path(&uploads.prefix, name, role);
                uploads.remote.upload(local, &remote).await?;
            }
            self.register(name, kargs.trim(), &uploads.prefix, &token).await
        };
        if let Err(e) = uploaded.await {
            error!("cobbler: creating profile {} failed: {}", name, e);
            uploads.remove(name).await;
            return Err(e);
        }
        self.client.sync(&token).await?;
        info!("cobbler: created profile {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::testing::FakeHost;

    type Calls = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

    struct FakeCobbler {
        client: Arc<CobblerClient>,
        calls: Calls,
    }

    impl FakeCobbler {
        fn methods(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls")
                .iter()
                .map(|(method, _)| method.clone())
                .filter(|method| method != "login")
                .collect()
        }

        fn params_of(&self, method: &str) -> Vec<Vec<Value>> {
            self.calls
                .lock()
                .expect("calls")
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    fn system(name: &str, mac: &str, comment: &str) -> Value {
        let mut interface = BTreeMap::new();
        interface.insert("mac_address".to_string(), Value::from(mac));
        let mut interfaces = BTreeMap::new();
        interfaces.insert("eth0".to_string(), Value::Struct(interface));
        let mut system = BTreeMap::new();
        system.insert("name".to_string(), Value::from(name));
        system.insert("comment".to_string(), Value::from(comment));
        system.insert("interfaces".to_string(), Value::Struct(interfaces));
        Value::Struct(system)
    }

    fn profile(name: &str, kernel_options: Value) -> Value {
        let mut profile = BTreeMap::new();
        profile.insert("name".to_string(), Value::from(name));
        profile.insert("kernel_options".to_string(), kernel_options);
        profile.insert("distro".to_string(), Value::from("imported"));
        Value::Struct(profile)
    }

    /// Remote files kept in memory.
    #[derive(Debug, Default)]
    struct FakeRemote {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl FakeRemote {
        fn paths(&self) -> Vec<String> {
            self.files.lock().expect("files").keys().cloned().collect()
        }
    }

    #[async_trait]
    impl RemoteFiles for FakeRemote {
        async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
            let data = tokio::fs::read(local).await?;
            self.files.lock().expect("files").insert(remote.to_string(), data);
            Ok(())
        }

        async fn remove(&self, remote: &str) -> Result<()> {
            self.files.lock().expect("files").remove(remote);
            Ok(())
        }
    }

    async fn profile_files(dir: &Path, kargs: &str) -> Result<ProfileFiles> {
        let mut files = ProfileFiles::new();
        for (role, content) in [("kernel", "vmlinuz"), ("initrd", "initramfs"), ("kargs", kargs)] {
            let path = dir.join(role);
            tokio::fs::write(&path, content).await?;
            files.insert(role.to_string(), path);
        }
        Ok(files)
    }

    fn uploading(client: Arc<CobblerClient>, remote: Arc<FakeRemote>) -> CobblerProfiles {
        let config = CobblerConfig {
            remote_path_prefix: "/srv/images/".into(),
            ..CobblerConfig::default()
        };
        CobblerProfiles::new(client).with_uploads(remote, &config)
    }

    const FAULT: &str = "<?xml version=\"1.0\"?>\n<methodResponse><fault><value><struct>\
        <member><name>faultCode</name><value><int>1</int></value></member>\
        <member><name>faultString</name><value><string>power management failed</string></value></member>\
        </struct></value></fault></methodResponse>\n";

    async fn read_body(stream: &mut TcpStream) -> std::io::Result<String> {
        let mut buf = vec![];
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(String::new());
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return Ok(String::from_utf8_lossy(&buf[end + 4..end + 4 + length]).to_string());
            }
        }
    }

    fn respond(method: &str, params: &[Value], systems: &Value, profiles: &Value) -> String {
        let value = match method {
            "login" => Value::from("token-1"),
            "get_systems" => systems.clone(),
            "get_profiles" => profiles.clone(),
            "find_system" => {
                let wanted = params.first().and_then(|c| c.get("name")).and_then(Value::as_str);
                let names = systems
                    .as_array()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|s| s.get("name").and_then(Value::as_str))
                    .filter(|name| Some(*name) == wanted)
                    .map(Value::from)
                    .collect();
                Value::Array(names)
            }
            "get_system_handle" => Value::from("handle-existing"),
            "new_system" => Value::from("handle-new"),
            "new_distro" => Value::from("handle-distro"),
            "new_profile" => Value::from("handle-profile"),
            "modify_profile" if params.get(2).and_then(Value::as_str) == Some("broken") => {
                return FAULT.to_string();
            }
            "power_system" if params.first().and_then(Value::as_str) == Some("handle-broken") => {
                return FAULT.to_string();
            }
            _ => Value::Bool(true),
        };
        xmlrpc::encode_response(&value)
    }

    async fn fake_cobbler(systems: Vec<Value>, profiles: Vec<Value>) -> Result<FakeCobbler> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let config = CobblerConfig {
            url: format!("http://{}/cobbler_api", listener.local_addr()?),
            timeout_secs: 5,
            ..CobblerConfig::default()
        };
        let calls: Calls = Arc::new(Mutex::new(vec![]));
        let recorded = calls.clone();
        let systems = Value::Array(systems);
        let profiles = Value::Array(profiles);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(body) = read_body(&mut stream).await else {
                    continue;
                };
                let Ok((method, params)) = xmlrpc::decode_call(&body) else {
                    continue;
                };
                let response = respond(&method, &params, &systems, &profiles);
                recorded.lock().expect("calls").push((method, params));
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response.len(),
                    response
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        Ok(FakeCobbler {
            client: Arc::new(CobblerClient::new(&config)?),
            calls,
        })
    }

    #[tokio::test]
    async fn test_that_only_lab_systems_become_hosts() -> Result<()> {
        let cobbler = fake_cobbler(
            vec![
                system("testbay-rack1", "52:54:00:AA:BB:01", ""),
                system("mail-server", "52:54:00:aa:bb:02", ""),
                system("bench", "52:54:00:aa:bb:03", ""),
                system("testbay-vm-x", "52:54:00:aa:bb:04", TRANSIENT_COMMENT),
            ],
            vec![],
        )
        .await?;
        let systems = CobblerSystems::new(cobbler.client.clone(), "^testbay-", vec!["bench".into()])?;
        let hosts = systems.items().await?;
        assert_eq!(vec!["bench", "testbay-rack1"], hosts.keys().collect::<Vec<_>>());
        assert_eq!(Some("52:54:00:aa:bb:01"), hosts["testbay-rack1"].mac());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_hosts_are_powered_through_cobbler() -> Result<()> {
        let cobbler = fake_cobbler(vec![system("testbay-rack1", "52:54:00:aa:bb:01", "")], vec![]).await?;
        let systems = CobblerSystems::new(cobbler.client.clone(), "^testbay-", vec![])?;
        let host = systems.items().await?.remove("testbay-rack1").expect("host");
        host.reboot().await?;
        host.shutdown().await?;
        let powers: Vec<Value> = cobbler
            .params_of("power_system")
            .into_iter()
            .map(|params| params[1].clone())
            .collect();
        assert_eq!(vec![Value::from("reboot"), Value::from("off")], powers);
        Ok(())
    }

    #[tokio::test]
    async fn test_that_faults_surface_as_backend_errors() -> Result<()> {
        let cobbler = fake_cobbler(vec![], vec![]).await?;
        let err = cobbler
            .client
            .power_system("handle-broken", "on", "token-1")
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Backend { message, .. } if message == "power management failed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_profiles_expose_their_kernel_options() -> Result<()> {
        let mut options = BTreeMap::new();
        options.insert("console".to_string(), Value::from("ttyS0"));
        options.insert("quiet".to_string(), Value::from("~"));
        let cobbler = fake_cobbler(
            vec![],
            vec![
                profile("fedora", Value::from("inst.text")),
                profile("rhel", Value::Struct(options)),
            ],
        )
        .await?;
        let profiles = CobblerProfiles::new(cobbler.client.clone()).items().await?;
        assert_eq!("inst.text a=1", profiles["fedora"].kargs("a=1"));
        assert_eq!("console=ttyS0 quiet", profiles["rhel"].kargs(""));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_foreign_hosts_get_transient_systems() -> Result<()> {
        let cobbler = fake_cobbler(vec![], vec![profile("fedora", Value::from("inst.text"))]).await?;
        let profiles = CobblerProfiles::new(cobbler.client.clone()).items().await?;
        let host = FakeHost::new("vm1");

        profiles["fedora"].assign_to(host.as_ref(), "abc", "").await?;
        assert_eq!(
            vec![
                "find_system",
                "new_system",
                "modify_system",
                "modify_system",
                "modify_system",
                "modify_system",
                "modify_system",
                "save_system",
                "sync"
            ],
            cobbler.methods()
        );
        let modified = cobbler.params_of("modify_system");
        assert_eq!(Value::from("testbay-transient-525400000001"), modified[0][2]);
        assert_eq!(Value::from("inst.text testbay_cookie=abc"), modified[4][2]);

        profiles["fedora"].revoke_from(host.as_ref()).await?;
        let removed = cobbler.params_of("remove_system");
        assert_eq!(
            vec![Value::from("testbay-transient-525400000001"), Value::from("token-1")],
            removed[0]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_that_pxe_toggles_netboot() -> Result<()> {
        let cobbler = fake_cobbler(
            vec![system("testbay-rack1", "52:54:00:aa:bb:01", "")],
            vec![profile("fedora", Value::from(""))],
        )
        .await?;
        let host = CobblerSystems::new(cobbler.client.clone(), "^testbay-", vec![])?
            .items()
            .await?
            .remove("testbay-rack1")
            .expect("host");
        let profiles = CobblerProfiles::new(cobbler.client.clone()).items().await?;
        profiles["fedora"].enable_pxe(host.as_ref(), false).await?;
        let modified = cobbler.params_of("modify_system");
        assert_eq!(Value::from("netboot_enabled"), modified[0][1]);
        assert_eq!(Value::Bool(false), modified[0][2]);
        assert!(cobbler.methods().ends_with(&["save_system".to_string(), "sync".to_string()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_profiles_need_ssh_to_be_created() -> Result<()> {
        let cobbler = fake_cobbler(vec![], vec![]).await?;
        let origin = CobblerProfiles::new(cobbler.client.clone());
        assert!(matches!(
            origin.create_profile("new", &BTreeMap::new()).await,
            Err(LabError::InvalidRequest(_))
        ));
        assert!(cobbler.methods().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_profiles_are_uploaded_and_registered() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cobbler = fake_cobbler(vec![], vec![profile("fedora", Value::from(""))]).await?;
        let remote = Arc::new(FakeRemote::default());
        let origin = uploading(cobbler.client.clone(), remote.clone());

        let files = profile_files(dir.path(), "console=ttyS0 testbay_cookie={testbay_cookie}\n").await?;
        origin.create_profile("f40", &files).await?;

        assert_eq!(
            vec!["/srv/images/testbay-f40-initrd", "/srv/images/testbay-f40-kernel"],
            remote.paths()
        );
        assert_eq!(
            vec![
                "get_profiles",
                "new_distro",
                "modify_distro",
                "modify_distro",
                "modify_distro",
                "modify_distro",
                "modify_distro",
                "save_distro",
                "new_profile",
                "modify_profile",
                "modify_profile",
                "modify_profile",
                "save_profile",
                "sync"
            ],
            cobbler.methods()
        );
        let distro = cobbler.params_of("modify_distro");
        assert_eq!(Value::from("/srv/images/testbay-f40-kernel"), distro[1][2]);
        let profile = cobbler.params_of("modify_profile");
        assert_eq!(Value::from("f40"), profile[1][2]);
        assert_eq!(
            Value::from("console=ttyS0 testbay_cookie={testbay_cookie}"),
            profile[2][2]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_that_existing_profiles_are_not_replaced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cobbler = fake_cobbler(vec![], vec![profile("fedora", Value::from(""))]).await?;
        let remote = Arc::new(FakeRemote::default());
        let origin = uploading(cobbler.client.clone(), remote.clone());
        let files = profile_files(dir.path(), "quiet").await?;
        assert!(matches!(
            origin.create_profile("fedora", &files).await,
            Err(LabError::InvalidRequest(_))
        ));
        assert!(remote.paths().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_failed_registrations_are_rolled_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cobbler = fake_cobbler(vec![], vec![]).await?;
        let remote = Arc::new(FakeRemote::default());
        let origin = uploading(cobbler.client.clone(), remote.clone());
        let files = profile_files(dir.path(), "quiet").await?;

        let err = origin.create_profile("broken", &files).await.unwrap_err();
        assert!(matches!(err, LabError::Backend { .. }));
        assert_eq!(
            vec![vec![Value::from("broken"), Value::from("token-1")]],
            cobbler.params_of("remove_distro")
        );
        assert!(remote.paths().is_empty());
        assert!(!cobbler.methods().contains(&"sync".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_that_created_profiles_are_deleted_with_their_distro() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut created = BTreeMap::new();
        created.insert("name".to_string(), Value::from("f40"));
        created.insert("distro".to_string(), Value::from("f40"));
        let cobbler = fake_cobbler(
            vec![],
            vec![Value::Struct(created), profile("fedora", Value::from(""))],
        )
        .await?;
        let remote = Arc::new(FakeRemote::default());
        for role in ["kernel", "initrd"] {
            let local = dir.path().join(role);
            tokio::fs::write(&local, role).await?;
            remote.upload(&local, &remote_path("/srv/images", "f40", role)).await?;
        }
        let profiles = uploading(cobbler.client.clone(), remote.clone()).items().await?;

        profiles["f40"].delete().await?;
        assert_eq!(vec!["remove_profile", "remove_distro", "sync"], cobbler.methods()[1..]);
        assert!(remote.paths().is_empty());

        profiles["fedora"].delete().await?;
        assert_eq!(1, cobbler.params_of("remove_distro").len());
        Ok(())
    }

    #[tokio::test]
    async fn test_that_kargs_are_cached_across_listings() -> Result<()> {
        let cobbler = fake_cobbler(vec![], vec![profile("fedora", Value::from("inst.text"))]).await?;
        let origin = CobblerProfiles::new(cobbler.client.clone());
        assert_eq!("inst.text a=1", origin.items().await?["fedora"].kargs("a=1"));
        assert_eq!("inst.text a=1", origin.items().await?["fedora"].kargs("a=1"));
        assert_eq!(1, origin.cache.len());
        Ok(())
    }
}
