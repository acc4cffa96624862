//! Machines that run test suites.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A physical or virtual machine. Implementations exist per backend; the
/// rest of the crate only ever sees `Arc<dyn Host>`.
///
/// Lifecycle calls may reach out over the network or spawn processes, so
/// callers must never hold a lock across them.
#[async_trait]
pub trait Host: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// The backend this host was listed by.
    fn backend(&self) -> &str;

    /// MAC address of the interface the host PXE-boots from.
    fn mac(&self) -> Option<&str>;

    /// The libvirt domain behind this host, if any.
    fn domain(&self) -> Option<&str> {
        None
    }

    /// Virtual hosts are torn down when their job is aborted.
    fn is_virtual(&self) -> bool {
        false
    }

    /// The host a job with `cookie` will drive. Existing machines return
    /// themselves; templates return a fresh instance bound to the job, with
    /// any state kept below `session_dir`.
    fn for_job(self: Arc<Self>, cookie: &str, session_dir: &Path) -> Arc<dyn Host>;

    async fn boot(&self) -> Result<()>;

    async fn reboot(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn define(&self) -> Result<()> {
        Ok(())
    }

    async fn undefine(&self) -> Result<()> {
        Ok(())
    }

    async fn create_images(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_images(&self) -> Result<()> {
        Ok(())
    }

    /// A serializable summary for listings.
    fn describe(&self) -> Value {
        serde_json::json!({
            "name": self.name(),
            "backend": self.backend(),
            "mac": self.mac(),
            "virtual": self.is_virtual(),
        })
    }
}

/// Normalize a MAC address to lowercase, colon separated form.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(octets.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_that_macs_are_normalized() {
        assert_eq!(
            Some("52:54:00:ab:cd:ef".to_string()),
            normalize_mac("52-54-00-AB-CD-EF")
        );
        assert_eq!(None, normalize_mac("52:54:00:ab:cd"));
        assert_eq!(None, normalize_mac("zz:54:00:ab:cd:ef"));
    }
}
