// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::runner::Script;
use crate::scripts::{
    build_installer::{BuildInstallerArgs, BuildInstallerScript},
    first_boot::{FirstBootArgs, FirstBootScript},
    patch_iso::{PatchIsoArgs, PatchIsoScript},
    prepare::{PrepareArgs, PrepareScript},
};

#[derive(Parser)]
pub struct App {
    /// The VM directory: holds the installation media, the system disk, the
    /// unattended-setup files, and an optional config.toml.
    #[arg(long)]
    pub vm_dir: Utf8PathBuf,

    /// Forces the tool to run in an interactive or non-interactive mode. If not
    /// set, the tool infers whether to run interactively from whether it is
    /// running in an interactive terminal.
    #[arg(long, default_value = Option::None)]
    pub interactive: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Builds a bootable installer.iso from a Windows distribution ESD,
    /// keeping only the configured edition.
    BuildInstaller {
        /// The path to the downloaded ESD archive.
        #[arg(long)]
        esd: Utf8PathBuf,

        /// The edition to extract, overriding the one in config.toml.
        #[arg(long)]
        edition: Option<String>,
    },

    /// Rewrites an existing installer ISO so it boots without the "Press any
    /// key" prompt.
    PatchIso {
        /// The path to the ISO to patch in place.
        #[arg(long)]
        iso: Utf8PathBuf,
    },

    /// Prepares the VM directory for first boot: picks the product key,
    /// packages the answer file, and creates the system disk.
    Prepare,

    /// Runs the unattended Windows installation in a throwaway VM.
    FirstBoot,
}

impl App {
    pub fn get_script(&self) -> Result<Box<dyn Script>> {
        let config = Config::load(&self.vm_dir)?;
        Ok(match &self.command {
            Command::BuildInstaller { esd, edition } => {
                Box::new(BuildInstallerScript::new(BuildInstallerArgs {
                    vm_dir: self.vm_dir.clone(),
                    esd: esd.clone(),
                    edition: edition
                        .clone()
                        .unwrap_or_else(|| config.edition.clone()),
                }))
            }
            Command::PatchIso { iso } => {
                Box::new(PatchIsoScript::new(PatchIsoArgs { iso: iso.clone() }))
            }
            Command::Prepare => Box::new(PrepareScript::new(PrepareArgs {
                vm_dir: self.vm_dir.clone(),
                config,
            })),
            Command::FirstBoot => {
                Box::new(FirstBootScript::new(FirstBootArgs {
                    vm_dir: self.vm_dir.clone(),
                    config,
                }))
            }
        })
    }
}
