// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM settings, stored as `config.toml` in the VM directory.

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Deserialize;

/// Settings that shape the guest and its installation. Every field has a
/// default, so an absent or empty config file yields a usable configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Guest memory in GiB.
    pub vm_mem: u32,

    /// Size of the guest's system disk in GiB.
    pub disksize: u32,

    /// The host port forwarded to the guest's RDP port. Also used to give
    /// each VM's mount point a distinct name, so two VMs with different RDP
    /// ports can have their disks mounted simultaneously.
    pub rdp_port: u16,

    /// Whether to strip Defender and SmartScreen from the installed image
    /// after first boot.
    pub debloat: bool,

    /// The Windows edition to extract when building installation media from
    /// an ESD, e.g. "Pro" or "Home N".
    pub edition: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vm_mem: 4,
            disksize: 40,
            rdp_port: 3389,
            debloat: true,
            edition: "Pro".to_owned(),
        }
    }
}

impl Config {
    /// Loads the configuration from `config.toml` in `vm_dir`. A missing file
    /// yields the defaults; a malformed file is an error.
    pub fn load(vm_dir: &Utf8Path) -> Result<Self> {
        let path = vm_dir.join("config.toml");
        if !path.exists() {
            log::debug!("no config file at {path}, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {path}"))?;

        toml::from_str(&raw)
            .with_context(|| format!("parsing config file {path}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.vm_mem, 4);
        assert_eq!(cfg.disksize, 40);
        assert_eq!(cfg.rdp_port, 3389);
        assert!(cfg.debloat);
        assert_eq!(cfg.edition, "Pro");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: Config =
            toml::from_str("vm_mem = 8\nedition = \"Home N\"\n").unwrap();
        assert_eq!(cfg.vm_mem, 8);
        assert_eq!(cfg.edition, "Home N");
        assert_eq!(cfg.disksize, 40);
        assert_eq!(cfg.rdp_port, 3389);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        let cfg = Config::load(path).unwrap();
        assert_eq!(cfg.disksize, 40);
    }
}
