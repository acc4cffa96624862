//! Copying profile images onto the Cobbler server.
//!
//! Cobbler only references kernels and initrds by path on its own host, so
//! new profiles are uploaded over ssh before the distro is created.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::Report;
use thrussh::ChannelMsg;
use tokio::fs;

use super::COBBLER;
use crate::error::{LabError, Result};
use crate::log::*;

/// Files on the Cobbler host.
#[async_trait]
pub trait RemoteFiles: Send + Sync + fmt::Debug {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Removing a missing file is not an error.
    async fn remove(&self, remote: &str) -> Result<()>;

    /// Verify the remote is usable. Called once at startup.
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

fn ssh_error(context: &str, e: impl fmt::Display) -> LabError {
    LabError::backend(COBBLER, format!("ssh {context}: {e}"))
}

/// Split `[ssh://][user@]host[:port]` into the user and a connectable
/// address. The user defaults to `root`, the port to 22.
pub fn parse_ssh_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri.strip_prefix("ssh://").unwrap_or(uri);
    let (user, host) = match rest.split_once('@') {
        Some((user, host)) => (user, host),
        None => ("root", rest),
    };
    if user.is_empty() || host.is_empty() || host.contains('/') {
        return Err(LabError::InvalidRequest(format!("bad ssh uri '{uri}'")));
    }
    let addr = match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        Some(_) => return Err(LabError::InvalidRequest(format!("bad port in ssh uri '{uri}'"))),
        None => format!("{host}:22"),
    };
    Ok((user.to_string(), addr))
}

#[derive(Debug)]
pub struct SshRemote {
    user: String,
    addr: String,
    key: PathBuf,
    passphrase: Option<String>,
    host_fingerprint: Option<String>,
    timeout: Duration,
}

impl SshRemote {
    pub fn new(
        uri: &str,
        key: PathBuf,
        passphrase: Option<String>,
        host_fingerprint: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let (user, addr) = parse_ssh_uri(uri)?;
        Ok(Self {
            user,
            addr,
            key,
            passphrase,
            host_fingerprint,
            timeout,
        })
    }

    async fn keypair(&self) -> Result<Arc<thrussh_keys::key::KeyPair>> {
        let encoded = fs::read_to_string(&self.key)
            .await
            .map_err(|e| ssh_error(&format!("reading key {}", self.key.display()), e))?;
        let keypair = thrussh_keys::decode_secret_key(&encoded, self.passphrase.as_deref())
            .map_err(|e| ssh_error(&format!("decoding key {}", self.key.display()), e))?;
        Ok(Arc::new(keypair))
    }

    /// Run `command` on the remote host, feeding it `input`, and fail
    /// unless it exits with status 0.
    #[tracing::instrument(skip(self, input), fields(addr = %self.addr))]
    async fn exec(&self, command: &str, input: Option<Vec<u8>>) -> Result<()> {
        let keypair = self.keypair().await?;
        tokio::time::timeout(self.timeout, self.exec_with(keypair, command, input))
            .await
            .map_err(|_| ssh_error(command, format!("timed out after {:?}", self.timeout)))?
    }

    async fn exec_with(
        &self,
        keypair: Arc<thrussh_keys::key::KeyPair>,
        command: &str,
        input: Option<Vec<u8>>,
    ) -> Result<()> {
        let client = SshClient {
            fingerprint: self.host_fingerprint.clone(),
        };
        let config = Arc::new(thrussh::client::Config::default());
        debug!("ssh: connecting to {}", self.addr);
        let mut session = thrussh::client::connect(config, self.addr.as_str(), client)
            .await
            .map_err(|e| ssh_error("connect", e))?;
        let authenticated = session
            .authenticate_publickey(self.user.as_str(), keypair)
            .await
            .map_err(|e| ssh_error("authentication", e))?;
        if !authenticated {
            return Err(ssh_error(
                "authentication",
                format!("{} refused the key for {}", self.addr, self.user),
            ));
        }
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_error(command, e))?;
        if let Some(input) = input {
            channel
                .data(&input[..])
                .await
                .map_err(|e| ssh_error(command, e))?;
        }
        channel.eof().await.map_err(|e| ssh_error(command, e))?;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { data, .. } => {
                    warn!("ssh: {}: {}", command, String::from_utf8_lossy(&data).trim_end());
                }
                ChannelMsg::ExitStatus { exit_status: 0 } => return Ok(()),
                ChannelMsg::ExitStatus { exit_status } => {
                    return Err(ssh_error(command, format!("exited with status {exit_status}")));
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        Err(ssh_error(command, "channel closed without an exit status"))
    }
}

#[async_trait]
impl RemoteFiles for SshRemote {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let data = fs::read(local).await?;
        info!("ssh: uploading {} to {}:{}", local.display(), self.addr, remote);
        let command = format!("cat > {}", shell_words::quote(remote));
        self.exec(&command, Some(data)).await
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        debug!("ssh: removing {}:{}", self.addr, remote);
        let command = format!("rm -f {}", shell_words::quote(remote));
        self.exec(&command, None).await
    }

    /// Only the key is verified; the host may come up later.
    async fn check(&self) -> Result<()> {
        self.keypair().await.map(|_| ())
    }
}

/// Accepts the server key if no fingerprint is pinned.
struct SshClient {
    fingerprint: Option<String>,
}

impl thrussh::client::Handler for SshClient {
    type Error = Report;
    type FutureUnit = futures::future::Ready<std::result::Result<(Self, thrussh::client::Session), Report>>;
    type FutureBool = futures::future::Ready<std::result::Result<(Self, bool), Report>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: thrussh::client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    fn check_server_key(self, server_public_key: &thrussh_keys::key::PublicKey) -> Self::FutureBool {
        let seen = server_public_key.fingerprint();
        let accepted = match &self.fingerprint {
            Some(pinned) => pinned.trim_start_matches("SHA256:") == seen,
            None => true,
        };
        if !accepted {
            error!("ssh: unexpected server key {}", seen);
        }
        self.finished_bool(accepted)
    }
}
