// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defines a script that runs the unattended Windows installation in a
//! throwaway libvirt domain and cleans up the result.

use std::{collections::HashMap, process::Command};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;

use crate::config::Config;
use crate::cpu;
use crate::domain::{self, DomainHandle, GuestArch, VmDescriptor};
use crate::mount::{self, MountSession};
use crate::nbd::BlockDeviceLease;
use crate::runner::{Context, Script, ScriptStep, Ui};
use crate::util::run_command_check_status;

/// Defender and SmartScreen files stripped from the installed image when
/// debloating is enabled. Paths are relative to the system volume root.
const DEFENDER_PATHS: &[&str] = &[
    "ProgramData/Microsoft/Windows Defender",
    "ProgramData/Microsoft/Windows Defender Advanced Threat Protection",
    "ProgramData/Microsoft/Windows Security Health",
    "Program Files/Windows Defender",
    "Program Files/Windows Defender Advanced Threat Protection",
    "Windows/System32/smartscreen.dll",
    "Windows/System32/smartscreen.exe",
    "Windows/System32/smartscreenps.dll",
    "Windows/SysWOW64/smartscreen.dll",
    "Windows/SysWOW64/smartscreenps.dll",
];

/// The Windows system volume is the fourth partition on a disk installed by
/// the answer file's partitioning scheme.
const SYSTEM_PARTITION: u32 = 4;

#[derive(Clone)]
pub struct FirstBootArgs {
    pub vm_dir: Utf8PathBuf,
    pub config: Config,
}

pub struct FirstBootScript {
    steps: Vec<ScriptStep>,
    args: FirstBootArgs,
}

impl FirstBootScript {
    pub fn new(args: FirstBootArgs) -> Self {
        Self { steps: get_script(), args }
    }
}

impl Script for FirstBootScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(
        &self,
        mut w: Box<dyn std::io::Write>,
    ) -> std::io::Result<()> {
        writeln!(w, "Installing Windows in a VM with these options:\n")?;

        let args = &self.args;
        writeln!(w, "  {}: {}", "VM directory".bold(), args.vm_dir)?;
        writeln!(w, "  {}: {} GiB", "Memory".bold(), args.config.vm_mem)?;
        writeln!(w, "  {}: {}", "Debloat".bold(), args.config.debloat)?;

        Ok(())
    }

    fn file_prerequisites(&self) -> Vec<Utf8PathBuf> {
        vec![
            self.args.vm_dir.join("installer.iso"),
            self.args.vm_dir.join("unattended.iso"),
            self.args.vm_dir.join("disk.qcow2"),
        ]
    }

    fn initial_context(&self) -> HashMap<String, String> {
        let args = &self.args;
        let vm_name = args
            .vm_dir
            .file_name()
            .unwrap_or("windows")
            .to_owned();

        [
            ("vm_dir".to_string(), args.vm_dir.to_string()),
            ("vm_name".to_string(), vm_name),
            ("vm_mem".to_string(), args.config.vm_mem.to_string()),
            ("rdp_port".to_string(), args.config.rdp_port.to_string()),
            ("debloat".to_string(), args.config.debloat.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

fn remove_stale_domains(ctx: &mut Context, ui: &Ui) -> Result<()> {
    domain::remove_stale_domains(ctx.get_var("vm_name").unwrap(), ui)
}

/// Defines the installation domain, boots it, and waits for Windows Setup
/// to power it off. The domain is removed on the way out whether or not the
/// installation succeeded.
fn run_installation(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    let vm_name = ctx.get_var("vm_name").unwrap();
    let memory_gib: u32 = ctx.get_var("vm_mem").unwrap().parse()?;

    let descriptor = VmDescriptor::first_boot(
        &vm_dir,
        vm_name,
        memory_gib,
        cpu::allocate(),
        GuestArch::host(),
    );

    let mut handle = DomainHandle::define_and_start(&descriptor, &vm_dir, ui)?;
    handle.launch_viewer();

    let result = handle.wait_for_shutdown(ui);
    handle.cleanup();
    result
}

/// Mounts the installed system volume over NBD and strips Defender from it.
fn remove_preinstalled_bloat(ctx: &mut Context, ui: &Ui) -> Result<()> {
    if ctx.get_var("debloat") != Some("true") {
        ui.set_substep("debloating disabled, skipping");
        return Ok(());
    }

    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    let rdp_port: u16 = ctx.get_var("rdp_port").unwrap().parse()?;
    let disk = vm_dir.join("disk.qcow2");

    let mut lease =
        BlockDeviceLease::acquire(&disk, SYSTEM_PARTITION, ui)?;
    let mount_point = mount::disk_mount_point(
        &mount::current_username(),
        rdp_port,
    );
    let mut session =
        MountSession::mount(lease.partition(), &mount_point, false, ui)?;

    let result = remove_defender(session.mount_point(), ui);

    session.unmount();
    lease.release();
    result
}

fn remove_defender(root: &Utf8Path, ui: &Ui) -> Result<()> {
    if !root.join("Windows").is_dir() {
        anyhow::bail!(
            "no Windows directory on the system volume; the installation \
             most likely was interrupted or shut down unsafely"
        );
    }

    for path in DEFENDER_PATHS {
        let full = root.join(path);
        run_command_check_status(
            Command::new("sudo").args(["rm", "-rf", full.as_str()]),
            ui,
        )
        .context("removing Defender from the installed image")?;
    }

    log::info!("removed Defender and SmartScreen from the installed image");
    Ok(())
}

fn get_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::with_prereqs(
            "remove stale installation domains",
            remove_stale_domains,
            &["virsh"],
        ),
        ScriptStep::with_prereqs(
            "install Windows in a new domain",
            run_installation,
            &["virsh"],
        ),
        ScriptStep::with_prereqs(
            "remove preinstalled bloat",
            remove_preinstalled_bloat,
            &["qemu-nbd", "lsblk", "mountpoint"],
        ),
    ]
}
