//! Origins for concrete sources of hosts, profiles, test suites and plans.
//!
//! - [`files`]: suites, plans and hosts described in local files, plus PXE
//!   profiles written into a TFTP tree.
//! - [`libvirt`]: existing domains and freshly created per-job domains.
//! - [`cobbler`]: systems and profiles of a Cobbler provisioning server.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer};

pub mod cobbler;
pub mod files;
pub mod libvirt;

pub const FILES: &str = "files";
pub const LIBVIRT: &str = "libvirt";
pub const COBBLER: &str = "cobbler";

/// Every backend name the controller knows how to enable.
pub const KNOWN_BACKENDS: [&str; 3] = [FILES, LIBVIRT, COBBLER];

/// Path lists may be given as YAML lists or as one colon separated string.
pub(crate) fn path_list<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Paths {
        Joined(String),
        List(Vec<PathBuf>),
    }

    Ok(match Paths::deserialize(deserializer)? {
        Paths::Joined(joined) => joined
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect(),
        Paths::List(paths) => paths,
    })
}
