//! Machine identity probing.
//!
//! The identity is a private, stable string tied to the hardware (or failing
//! that, to the root filesystem) of the machine we run on. It is recomputed on
//! every use and never written anywhere. Each source prefixes its value with a
//! tag so that a machine switching sources produces a different identity
//! instead of silently colliding with another one.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Environment variable that replaces every probed source.
pub const MACHINE_ID_ENV: &str = "KEYMASTER_MACHINE_ID";

const TAG_OVERRIDE: &str = "override";
const TAG_PRODUCT_UUID: &str = "dmi";
const TAG_SERIAL: &str = "serial";
const TAG_ROOTFS_UUID: &str = "rootfs-uuid";

const PRODUCT_UUID_PATH: &str = "sys/class/dmi/id/product_uuid";
const CPUINFO_PATH: &str = "proc/cpuinfo";
const MOUNTS_PATH: &str = "proc/self/mounts";
const DISK_BY_UUID_PATH: &str = "dev/disk/by-uuid";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no machine identity source available; set KEYMASTER_MACHINE_ID to provide one")]
    NoIdentityAvailable,
}

/// Reads the machine identity from a filesystem root. Production code probes
/// `/`; tests point it at a fixture tree.
#[derive(Debug, Clone)]
pub struct MachineIdentityProvider {
    root: PathBuf,
    override_value: Option<String>,
}

impl Default for MachineIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineIdentityProvider {
    /// Probes the live system, honouring [`MACHINE_ID_ENV`] when set.
    pub fn new() -> Self {
        let override_value = std::env::var(MACHINE_ID_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Self {
            root: PathBuf::from("/"),
            override_value,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets an explicit identity. Empty strings are ignored so a blank config
    /// value can never become a valid identity.
    pub fn with_override(mut self, value: Option<String>) -> Self {
        if let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.override_value = Some(value);
        }
        self
    }

    /// Returns the first available identity in priority order: override,
    /// hardware product UUID, platform serial number, root filesystem UUID.
    pub fn machine_identity(&self) -> Result<String, IdentityError> {
        let probes: [(&str, Option<String>); 4] = [
            (TAG_OVERRIDE, self.override_value.clone()),
            (TAG_PRODUCT_UUID, self.product_uuid()),
            (TAG_SERIAL, self.cpu_serial()),
            (TAG_ROOTFS_UUID, self.rootfs_uuid()),
        ];
        for (tag, value) in probes {
            if let Some(value) = value {
                debug!(source = tag, "machine identity resolved");
                return Ok(format!("{tag}:{value}"));
            }
        }
        Err(IdentityError::NoIdentityAvailable)
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// The DMI product UUID is normally root-only; only trust it when the file
    /// is world readable, otherwise an unprivileged client and a privileged one
    /// on the same machine would derive different identities.
    fn product_uuid(&self) -> Option<String> {
        let path = self.path(PRODUCT_UUID_PATH);
        if !world_readable(&path) {
            return None;
        }
        let value = fs::read_to_string(&path).ok()?;
        let value = value.trim().to_ascii_lowercase();
        (!value.is_empty()).then_some(value)
    }

    /// Single-board computers expose a `Serial` line in cpuinfo.
    fn cpu_serial(&self) -> Option<String> {
        let cpuinfo = fs::read_to_string(self.path(CPUINFO_PATH)).ok()?;
        cpuinfo
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == "Serial")
            .map(|(_, value)| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty() && value.chars().any(|c| c != '0'))
    }

    fn rootfs_uuid(&self) -> Option<String> {
        let mounts = fs::read_to_string(self.path(MOUNTS_PATH)).ok()?;
        // Later mounts over `/` shadow earlier ones.
        let device = mounts
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mountpoint = fields.next()?;
                (mountpoint == "/" && device.starts_with('/')).then_some(device)
            })
            .last()?;
        let device = fs::canonicalize(self.path(device.trim_start_matches('/'))).ok()?;

        let entries = fs::read_dir(self.path(DISK_BY_UUID_PATH)).ok()?;
        entries.flatten().find_map(|entry| {
            let target = fs::canonicalize(entry.path()).ok()?;
            (target == device).then(|| entry.file_name().to_string_lossy().to_ascii_lowercase())
        })
    }
}

#[cfg(unix)]
fn world_readable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o004 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn world_readable(path: &Path) -> bool {
    path.is_file()
}

/// Convenience wrapper over [`MachineIdentityProvider::new`].
pub fn machine_identity() -> Result<String, IdentityError> {
    MachineIdentityProvider::new().machine_identity()
}
