// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defines a script that readies a VM directory for first boot: the answer
//! file gets the right product key, and the answer-file media and system
//! disk are created.

use std::{collections::HashMap, process::Command};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;

use crate::config::Config;
use crate::mount::MountSession;
use crate::runner::{Context, Script, ScriptStep, Ui};
use crate::unattend::{self, KeyUpdater};
use crate::util::run_command_check_status;
use crate::wim;

#[derive(Clone)]
pub struct PrepareArgs {
    pub vm_dir: Utf8PathBuf,
    pub config: Config,
}

pub struct PrepareScript {
    steps: Vec<ScriptStep>,
    args: PrepareArgs,
}

impl PrepareScript {
    pub fn new(args: PrepareArgs) -> Self {
        Self { steps: get_script(), args }
    }
}

impl Script for PrepareScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(
        &self,
        mut w: Box<dyn std::io::Write>,
    ) -> std::io::Result<()> {
        writeln!(w, "Preparing a VM for first boot with these options:\n")?;

        let args = &self.args;
        writeln!(w, "  {}: {}", "VM directory".bold(), args.vm_dir)?;
        writeln!(w, "  {}: {} GiB", "Disk size".bold(), args.config.disksize)?;

        Ok(())
    }

    fn file_prerequisites(&self) -> Vec<Utf8PathBuf> {
        vec![
            self.args.vm_dir.join("installer.iso"),
            self.args.vm_dir.join("unattended").join("autounattend.xml"),
        ]
    }

    fn initial_context(&self) -> HashMap<String, String> {
        let args = &self.args;
        [
            ("vm_dir".to_string(), args.vm_dir.to_string()),
            ("disksize".to_string(), args.config.disksize.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

/// Mounts the installer ISO read-only and reads the edition name out of its
/// install image, then picks the matching generic install key.
fn detect_edition(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    let iso = vm_dir.join("installer.iso");

    let mount_dir = tempfile::tempdir()?;
    let mount_point = Utf8Path::from_path(mount_dir.path())
        .ok_or_else(|| anyhow::anyhow!("temp dir path is not UTF-8"))?;

    let mut session = MountSession::mount(&iso, mount_point, true, ui)?;

    let sources = session.mount_point().join("sources");
    let image = [sources.join("install.wim"), sources.join("install.esd")]
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| {
            anyhow::anyhow!("neither install.wim nor install.esd found in {iso}")
        })?;

    let output = run_command_check_status(
        Command::new("wiminfo").arg(image.as_str()),
        ui,
    )?;
    session.unmount();

    let edition =
        wim::first_edition_name(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| {
                anyhow::anyhow!("could not read an edition name from {image}")
            })?;

    let key = match unattend::key_for_edition(&edition) {
        Some(key) => key,
        None => {
            log::warn!(
                "no install key known for \"{edition}\", using the Pro key"
            );
            unattend::FALLBACK_KEY
        }
    };

    ui.set_substep(format!("detected \"{edition}\""));
    ctx.set_var("detected_edition", edition);
    ctx.set_var("product_key", key.to_owned());
    Ok(())
}

fn update_answer_file(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    let answer_file = vm_dir.join("unattended").join("autounattend.xml");
    let rewritten = vm_dir.join("unattended").join("autounattend.xml.new");

    let updater = KeyUpdater::new(ctx.get_var("product_key").unwrap());
    let replaced = updater.run(&answer_file, &rewritten)?;
    std::fs::rename(&rewritten, &answer_file)?;

    ui.set_substep(format!("replaced {replaced} product key(s)"));
    Ok(())
}

/// Best-effort: the floppy is a fallback discovery path for the answer
/// file, so not being able to build one shouldn't stop the preparation.
fn create_answer_floppy(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    if let Err(e) = unattend::create_answer_floppy(&vm_dir, ui) {
        log::warn!("could not build the answer-file floppy: {e}");
        let _ = std::fs::remove_file(vm_dir.join("autounattend.img"));
    }

    Ok(())
}

fn build_unattended_iso(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    let output = vm_dir.join("unattended.iso");
    let source = vm_dir.join("unattended");

    // mkisofs and genisoimage take the same arguments for this job.
    let tool = if which::which("mkisofs").is_ok() {
        "mkisofs"
    } else {
        "genisoimage"
    };

    run_command_check_status(
        Command::new(tool).args([
            "-quiet",
            "-l",
            "-J",
            "-r",
            "-allow-lowercase",
            "-allow-multidot",
            "-o",
            output.as_str(),
            source.as_str(),
        ]),
        ui,
    )
    .map(|_| ())
}

fn create_system_disk(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let vm_dir = Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap());
    let disk = vm_dir.join("disk.qcow2");
    if disk.exists() {
        let proceed = ui.confirm(&format!(
            "{disk} already exists; continuing will DELETE it and start \
             over with a clean install. Continue?"
        ))?;
        if !proceed {
            anyhow::bail!("keeping the existing {disk}");
        }
    }
    clear_existing_disk(&disk)?;

    let size = format!("{}G", ctx.get_var("disksize").unwrap());
    run_command_check_status(
        Command::new("qemu-img").args([
            "create",
            "-f",
            "qcow2",
            "-o",
            "cluster_size=2M,nocow=on,preallocation=metadata",
            disk.as_str(),
            &size,
        ]),
        ui,
    )
    .context("creating the system disk")
    .map(|_| ())
}

/// Deletes any leftover system disk so first boot always starts from a
/// freshly-created image instead of silently booting a previous install.
fn clear_existing_disk(disk: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(disk) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("deleting {disk}")),
    }
}

fn get_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::with_prereqs(
            "detect the Windows edition on the installer",
            detect_edition,
            &["wiminfo"],
        ),
        ScriptStep::new(
            "write the product key into the answer file",
            update_answer_file,
        ),
        ScriptStep::with_prereqs(
            "build the answer-file floppy",
            create_answer_floppy,
            &["dd", "mkfs.fat"],
        ),
        ScriptStep::with_prereqs(
            "build the answer-file ISO",
            build_unattended_iso,
            &["genisoimage"],
        ),
        ScriptStep::with_prereqs(
            "create the system disk",
            create_system_disk,
            &["qemu-img"],
        ),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn existing_disk_is_deleted_before_recreation() {
        let dir = tempfile::tempdir().unwrap();
        let vm_dir = Utf8Path::from_path(dir.path()).unwrap();
        let disk = vm_dir.join("disk.qcow2");
        std::fs::write(&disk, b"an installed system").unwrap();

        clear_existing_disk(&disk).unwrap();
        assert!(!disk.exists());
    }

    #[test]
    fn clearing_a_missing_disk_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let vm_dir = Utf8Path::from_path(dir.path()).unwrap();

        clear_existing_disk(&vm_dir.join("disk.qcow2")).unwrap();
    }
}
