//! Stable machine identity.
//!
//! Used to derive the deterministic suffix for mDNS name-conflict
//! resolution: the same device must re-adopt the same conflict-free name
//! across reboots. The identifier source is probed in preference order and
//! the result is injected into the responder at construction, so tests can
//! substitute a fixed identity.

use std::fmt;

use sha2::{Digest, Sha256};
use tracing::debug;

const MACHINE_ID_PATH: &str = "/etc/machine-id";
const SYSFS_NET: &str = "/sys/class/net";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    MachineIdFile,
    MacAddress,
    Hostname,
}

impl fmt::Display for IdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdSource::MachineIdFile => write!(f, "machine-id"),
            IdSource::MacAddress => write!(f, "mac-address"),
            IdSource::Hostname => write!(f, "hostname"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineId {
    source: IdSource,
    raw: String,
}

impl MachineId {
    /// Probes, in order: the machine-id file, the first non-loopback MAC
    /// address, the OS hostname. The last resort cannot fail: a host always
    /// has some name.
    pub fn detect() -> Self {
        if let Ok(contents) = std::fs::read_to_string(MACHINE_ID_PATH) {
            let id = contents.trim();
            if !id.is_empty() {
                debug!(source = %IdSource::MachineIdFile, "machine identity detected");
                return Self {
                    source: IdSource::MachineIdFile,
                    raw: id.to_string(),
                };
            }
        }

        if let Some(mac) = first_mac_address() {
            debug!(source = %IdSource::MacAddress, "machine identity detected");
            return Self {
                source: IdSource::MacAddress,
                raw: mac,
            };
        }

        let name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        debug!(source = %IdSource::Hostname, "machine identity detected");
        Self {
            source: IdSource::Hostname,
            raw: name,
        }
    }

    /// A fixed identity, for deterministic tests.
    pub fn fixed(source: IdSource, raw: impl Into<String>) -> Self {
        Self {
            source,
            raw: raw.into(),
        }
    }

    pub fn source(&self) -> IdSource {
        self.source
    }

    /// Six lowercase hex characters, stable for a given identity.
    pub fn suffix6(&self) -> String {
        let digest = Sha256::digest(self.raw.as_bytes());
        hex::encode(&digest[..3])
    }
}

/// First non-loopback MAC address from sysfs, skipping all-zero addresses
/// (bridges and tunnels report those).
fn first_mac_address() -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(SYSFS_NET)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    for name in names {
        let path = format!("{SYSFS_NET}/{name}/address");
        if let Ok(contents) = std::fs::read_to_string(path) {
            let mac = contents.trim();
            if !mac.is_empty() && mac.bytes().any(|b| b != b'0' && b != b':') {
                return Some(mac.to_string());
            }
        }
    }
    None
}
